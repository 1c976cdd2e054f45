//! HTTP client for the receiver's upload protocol.

use crate::config::ServerConfig;
use crate::transfer::{ProgressCallback, ProgressStream};
use crate::utils::errors::{ClientError, Result};
use backup_protocol::wire::{
    CommitRequest, CommitResponse, ErrorBody, FileOffsetResponse, HasHashesResponse,
    InitBackupRequest, InitBackupResponse, UploadResponse, HEADER_FILE_SIZE, HEADER_START_BYTE,
};
use backup_protocol::ContentHash;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Slowest upload rate tolerated before an upload request times out.
const MIN_UPLOAD_BYTES_PER_SEC: u64 = 256 * 1024;

/// Where one upload's bytes belong.
#[derive(Debug, Clone)]
pub struct UploadTarget<'a> {
    pub sha: &'a ContentHash,
    pub relpath: &'a str,
    pub version_id: &'a str,
}

#[derive(Clone)]
pub struct ReceiverClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ReceiverClient {
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(server.timeout())
            .user_agent(concat!("backup-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: server.url.trim_end_matches('/').to_string(),
            timeout: server.timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Upload requests get the normal timeout plus time for the body at the
    /// minimum tolerated rate.
    fn upload_timeout(&self, len: u64) -> Duration {
        self.timeout + Duration::from_secs(len / MIN_UPLOAD_BYTES_PER_SEC)
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let resp = self.http.get(self.url("/health")).timeout(self.timeout).send().await?;
        parse(resp).await
    }

    /// How many bytes of `sha` the receiver holds where uploads append.
    /// `size` is the full file size.
    pub async fn file_offset(&self, sha: &ContentHash, size: u64) -> Result<FileOffsetResponse> {
        let size = size.to_string();
        let resp = self
            .http
            .get(self.url("/file-offset"))
            .query(&[("sha", sha.as_str()), ("size", size.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;
        parse(resp).await
    }

    pub async fn init(&self, req: &InitBackupRequest) -> Result<InitBackupResponse> {
        let resp = self
            .http
            .post(self.url("/init-backup"))
            .json(req)
            .timeout(self.timeout)
            .send()
            .await?;
        parse(resp).await
    }

    /// Streams `path` from byte `start` to `total` as the body of one upload.
    pub async fn upload(
        &self,
        target: &UploadTarget<'_>,
        path: &Path,
        start: u64,
        total: u64,
        progress: ProgressCallback,
    ) -> Result<UploadResponse> {
        let mut file = tokio::fs::File::open(path).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        let len = total.saturating_sub(start);
        let body = ProgressStream::new(ReaderStream::new(file.take(len)), progress);

        let resp = self
            .http
            .post(self.url("/upload-file"))
            .query(&[
                ("sha", target.sha.as_str()),
                ("relpath", target.relpath),
                ("versionId", target.version_id),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(HEADER_START_BYTE, start.to_string())
            .header(HEADER_FILE_SIZE, total.to_string())
            .body(reqwest::Body::wrap_stream(body))
            .timeout(self.upload_timeout(len))
            .send()
            .await?;
        parse(resp).await
    }

    pub async fn commit(&self, req: &CommitRequest) -> Result<CommitResponse> {
        let resp = self
            .http
            .post(self.url("/commit-version"))
            .json(req)
            .timeout(self.timeout)
            .send()
            .await?;
        parse(resp).await
    }

    pub async fn has_hashes(&self, hashes: &[ContentHash]) -> Result<HasHashesResponse> {
        let query: Vec<(&str, &str)> = hashes.iter().map(|h| ("sha", h.as_str())).collect();
        let resp = self
            .http
            .get(self.url("/status/has-hashes"))
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await?;
        parse(resp).await
    }
}

/// Decodes a 2xx body, or turns the receiver's error body into the matching
/// [`ClientError`].
async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        let bytes = resp.bytes().await?;
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(rejection(status, &text))
}

fn rejection(status: StatusCode, text: &str) -> ClientError {
    let body: ErrorBody = serde_json::from_str(text).unwrap_or_else(|_| ErrorBody {
        error: text.trim().to_string(),
        ..Default::default()
    });
    match status {
        StatusCode::CONFLICT if !body.missing_hashes.is_empty() => ClientError::MissingContent(
            body.missing_hashes.into_iter().map(String::from).collect(),
        ),
        StatusCode::CONFLICT if body.bytes.is_some() => ClientError::OffsetGap {
            bytes: body.bytes.unwrap_or_default(),
        },
        StatusCode::UNPROCESSABLE_ENTITY if body.computed.is_some() => ClientError::Integrity {
            computed: body.computed.unwrap_or_default(),
        },
        _ => ClientError::Rejected {
            status: status.as_u16(),
            message: body.error,
        },
    }
}

/// Progress callback that discards reports.
pub fn no_progress() -> ProgressCallback {
    Arc::new(|_: u64| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_mapping() {
        let gap = rejection(StatusCode::CONFLICT, r#"{"error":"upload incomplete","bytes":40}"#);
        assert!(matches!(gap, ClientError::OffsetGap { bytes: 40 }));

        let bad = rejection(StatusCode::UNPROCESSABLE_ENTITY, r#"{"error":"hash mismatch","computed":"ab"}"#);
        assert!(matches!(bad, ClientError::Integrity { ref computed } if computed == "ab"));

        let missing = rejection(
            StatusCode::CONFLICT,
            &format!(r#"{{"error":"x","missingHashes":["{}"]}}"#, backup_protocol::hash_bytes(b"a")),
        );
        assert!(matches!(missing, ClientError::MissingContent(ref v) if v.len() == 1));

        let plain = rejection(StatusCode::BAD_REQUEST, "not json");
        assert!(matches!(plain, ClientError::Rejected { status: 400, ref message } if message == "not json"));
    }

    #[test]
    fn test_upload_timeout_grows_with_size() {
        let client = ReceiverClient::new(&crate::Config::default().server).unwrap();
        assert_eq!(client.upload_timeout(0), Duration::from_secs(60));
        assert_eq!(client.upload_timeout(MIN_UPLOAD_BYTES_PER_SEC * 10), Duration::from_secs(70));
    }
}
