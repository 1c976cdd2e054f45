use crate::error::AppError;
use crate::services::backup_session::{self, UploadTarget};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Query, RawQuery, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_protocol::wire::{
    CommitRequest, CommitResponse, FileOffsetResponse, HasHashesResponse, InitBackupRequest,
    InitBackupResponse, UploadResponse, HEADER_FILE_SIZE, HEADER_START_BYTE,
};
use backup_protocol::ContentHash;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/file-offset", get(file_offset))
        .route("/init-backup", post(init_backup))
        .route("/upload-file", post(upload_file))
        .route("/commit-version", post(commit_version))
        .route("/status/has-hashes", get(has_hashes))
}

#[derive(Deserialize)]
pub struct ShaQuery {
    pub sha: Option<String>,
}

#[derive(Deserialize)]
pub struct OffsetQuery {
    pub sha: Option<String>,
    /// Full file size, lets a complete copy outside the active location count
    pub size: Option<u64>,
}

pub fn parse_sha(raw: Option<&str>) -> Result<ContentHash, AppError> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("sha required".into()))?;
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid sha: {}", raw)))
}

async fn file_offset(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OffsetQuery>,
) -> Result<Json<FileOffsetResponse>, AppError> {
    let sha = parse_sha(query.sha.as_deref())?;
    let store_state = state.clone();
    let size = query.size;
    let offset = tokio::task::spawn_blocking(move || backup_session::file_offset(&store_state, &sha, size))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(offset))
}

async fn init_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitBackupRequest>,
) -> Result<Json<InitBackupResponse>, AppError> {
    let response = backup_session::init_backup(&state, body).await?;
    Ok(Json(response))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub sha: Option<String>,
    pub relpath: Option<String>,
    pub version_id: Option<String>,
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, AppError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| AppError::BadRequest(format!("invalid {} header", name))),
    }
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>, AppError> {
    let (Some(relpath), Some(version_id)) = (query.relpath, query.version_id) else {
        return Err(AppError::BadRequest("sha, relpath, versionId required".into()));
    };
    let sha = parse_sha(query.sha.as_deref())?;
    let start_byte = header_u64(&headers, HEADER_START_BYTE)?.unwrap_or(0);
    let declared_size = header_u64(&headers, HEADER_FILE_SIZE)?;

    let target = UploadTarget {
        sha,
        relpath,
        version_id,
    };
    let response = backup_session::upload(
        &state,
        target,
        start_byte,
        declared_size,
        body.into_data_stream(),
    )
    .await?;
    Ok(Json(response))
}

async fn commit_version(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CommitRequest>,
) -> Result<Json<CommitResponse>, AppError> {
    let response = backup_session::commit(&state, body).await?;
    Ok(Json(response))
}

/// Accepts repeated `sha=` keys as well as the `sha[]=` array form.
fn sha_params(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| matches!(*key, "sha" | "sha[]" | "sha%5B%5D"))
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

async fn has_hashes(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<HasHashesResponse>, AppError> {
    let shas = sha_params(raw.as_deref());
    let result = tokio::task::spawn_blocking(move || backup_session::has_hashes(&state, &shas))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(Json(result))
}
