//! Error types for the backup client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Non-2xx answer from the receiver
    #[error("Receiver rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Receiver hashed the uploaded bytes to something else and dropped them
    #[error("Integrity check failed: receiver computed {computed}")]
    Integrity { computed: String },

    /// Receiver holds a different number of bytes than the upload assumed
    #[error("Upload offset mismatch, receiver holds {bytes} bytes")]
    OffsetGap { bytes: u64 },

    #[error("Commit refused, {} hashes still missing", .0.len())]
    MissingContent(Vec<String>),

    #[error("A backup run is already in progress")]
    RunInProgress,

    #[error("No files to back up under {0}")]
    NothingToBackUp(String),

    #[error("All {0} uploads failed, nothing to commit")]
    UploadsFailed(usize),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Failures worth another attempt of the same upload.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_)
            | ClientError::Http(_)
            | ClientError::Integrity { .. }
            | ClientError::OffsetGap { .. } => true,
            ClientError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::OffsetGap { bytes: 3 }.is_retryable());
        assert!(ClientError::Rejected { status: 503, message: String::new() }.is_retryable());
        assert!(!ClientError::Rejected { status: 400, message: String::new() }.is_retryable());
        assert!(!ClientError::RunInProgress.is_retryable());
    }
}
