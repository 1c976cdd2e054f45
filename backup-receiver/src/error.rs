use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_protocol::wire::ErrorBody;
use backup_protocol::ContentHash;
use crate::store::LocationError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    /// Commit refused because some referenced content is not fully stored
    #[error("{message}")]
    MissingContent {
        message: String,
        missing: Vec<ContentHash>,
    },

    /// Client tried to resume past the end of what the receiver holds
    #[error("{message}")]
    OffsetGap { message: String, bytes: u64 },

    /// Uploaded bytes do not hash to the requested content hash
    #[error("hash mismatch")]
    HashMismatch { computed: ContentHash },

    #[error("{0}")]
    Unprocessable(String),

    #[error("requested range not satisfiable")]
    RangeNotSatisfiable { total: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = ErrorBody {
            error: self.to_string(),
            ..Default::default()
        };
        let status = match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::MissingContent { missing, .. } => {
                body.missing_hashes = missing;
                StatusCode::CONFLICT
            }
            AppError::OffsetGap { bytes, .. } => {
                body.bytes = Some(bytes);
                StatusCode::CONFLICT
            }
            AppError::HashMismatch { computed } => {
                body.computed = Some(computed.to_string());
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RangeNotSatisfiable { total } => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(axum::http::header::CONTENT_RANGE, format!("bytes */{}", total))],
                )
                    .into_response();
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                body.error = "Internal server error".into();
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<LocationError> for AppError {
    fn from(e: LocationError) -> Self {
        match e {
            LocationError::InvalidIndex => AppError::BadRequest(e.to_string()),
            LocationError::LastLocation | LocationError::ActiveLocation => {
                AppError::Conflict(e.to_string())
            }
        }
    }
}

/// Join errors from `spawn_blocking` are bugs, never client mistakes.
pub fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError::Internal(anyhow::anyhow!(e))
}
