use crate::error::AppError;
use crate::routes::backup::{parse_sha, ShaQuery};
use crate::services::catalog::{self, SearchMatch};
use crate::services::version_manifest::{self, VersionManifest};
use crate::state::AppState;
use crate::utils::mime;
use crate::utils::paths::resolve_version_path;
use crate::utils::range::RangeRequest;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use backup_protocol::ContentHash;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/browse", get(browse))
        .route("/list", get(list))
        .route("/version-manifest", get(get_version_manifest))
        .route("/file", get(get_file))
        .route("/file-by-sha", get(get_file_by_sha))
        .route("/search", get(search))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version_id: String,
    pub path: String,
    pub created_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date_folder: String,
    pub versions: Vec<VersionSummary>,
}

#[derive(Serialize)]
pub struct BrowseResponse {
    pub days: Vec<DaySummary>,
}

async fn browse(State(state): State<Arc<AppState>>) -> Result<Json<BrowseResponse>, AppError> {
    let days = state
        .meta
        .days_with_versions()
        .await?
        .into_iter()
        .map(|(day, versions)| DaySummary {
            date_folder: day.folder,
            versions: versions
                .into_iter()
                .map(|v| VersionSummary {
                    version_id: v.version_id,
                    path: v.path,
                    created_at: v.created_at,
                })
                .collect(),
        })
        .collect();
    Ok(Json(BrowseResponse { days }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub date_folder: Option<String>,
}

async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let folder = query
        .date_folder
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AppError::BadRequest("dateFolder required".into()))?;
    let versions = state.meta.list_versions(&folder).await?;
    Ok(Json(serde_json::json!({
        "dateFolder": folder,
        "versions": versions,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionPathQuery {
    pub version_path: Option<String>,
    pub relpath: Option<String>,
}

async fn load_manifest(state: &AppState, version_path: Option<&str>) -> Result<VersionManifest, AppError> {
    let version_path = version_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::BadRequest("versionPath required".into()))?;
    let dir = resolve_version_path(&state.config.data_root, version_path)
        .ok_or_else(|| AppError::BadRequest("invalid versionPath".into()))?;
    version_manifest::read(&dir)
        .await?
        .ok_or_else(|| AppError::NotFound("manifest not found".into()))
}

async fn get_version_manifest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VersionPathQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let manifest = load_manifest(&state, query.version_path.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "manifest": manifest,
        "versionPath": query.version_path,
    })))
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VersionPathQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let relpath = query
        .relpath
        .clone()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AppError::BadRequest("versionPath & relpath required".into()))?;
    let manifest = load_manifest(&state, query.version_path.as_deref()).await?;
    let entry = manifest
        .files
        .get(&relpath)
        .ok_or_else(|| AppError::NotFound("file not found in manifest".into()))?;

    let file_name = relpath.rsplit('/').next().unwrap_or(&relpath).replace('"', "");
    let mut response = serve_blob(&state, &entry.sha, &headers, mime::guess(&relpath)).await?;
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
        response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn get_file_by_sha(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShaQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let sha = parse_sha(query.sha.as_deref())?;
    serve_blob(&state, &sha, &headers, "application/octet-stream").await
}

/// Streams a blob, honoring a single `Range` request.
async fn serve_blob(
    state: &AppState,
    sha: &ContentHash,
    headers: &HeaderMap,
    content_type: &'static str,
) -> Result<Response, AppError> {
    let store = state.store.clone();
    let hash = sha.clone();
    let (_, total) = tokio::task::spawn_blocking(move || store.locate(&hash))
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("content not found in store".into()))?;

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let (start, len, partial) = match RangeRequest::parse(range_header, total) {
        RangeRequest::Full => (0, total, None),
        RangeRequest::Partial { start, end } => (start, end - start + 1, Some((start, end))),
        RangeRequest::Unsatisfiable => return Err(AppError::RangeNotSatisfiable { total }),
    };

    let store = state.store.clone();
    let hash = sha.clone();
    let file = tokio::task::spawn_blocking(move || store.open_range(&hash, start))
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("content not found in store".into()))?;

    let reader = tokio::fs::File::from_std(file).take(len);
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes");
    builder = match partial {
        Some((start, end)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total)),
        None => builder.status(StatusCode::OK),
    };
    builder
        .body(body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub q: String,
    pub count: usize,
    pub matches: Vec<SearchMatch>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, AppError> {
    let q = query
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::BadRequest("q required".into()))?;
    let matches = catalog::search(&state, &q).await?;
    Ok(Json(SearchResponse {
        q,
        count: matches.len(),
        matches,
    }))
}
