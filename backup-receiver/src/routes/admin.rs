use crate::error::AppError;
use crate::models::version::VersionRecord;
use crate::services::catalog::{self, Stats};
use crate::services::version_manifest;
use crate::state::AppState;
use crate::store::DirectoryBackend;
use crate::utils::paths::{is_plain_segment, resolve_version_path};
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(stats))
        .route("/config", get(get_config))
        .route("/config/storage", post(add_storage))
        .route("/config/storage/active", post(set_active_storage))
        .route("/config/storage/{index}", delete(remove_storage))
        .route("/backups", get(list_backups))
        .route("/backups/{day}", delete(delete_day))
        .route("/backups/{day}/{version_id}", get(get_backup).delete(delete_backup))
        .route("/sessions/prune", post(prune_sessions))
}

fn success() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Stats>, AppError> {
    Ok(Json(catalog::stats(&state).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub storage_locations: Vec<PathBuf>,
    pub active_storage_index: usize,
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<StorageConfig> {
    let (storage_locations, active_storage_index) = state.store.locations();
    Json(StorageConfig {
        storage_locations,
        active_storage_index,
    })
}

#[derive(Deserialize)]
pub struct AddStorageRequest {
    pub path: Option<String>,
}

async fn add_storage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddStorageRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let path = body
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Path is required".into()))?;

    let backend = DirectoryBackend::open(&path)
        .map_err(|e| AppError::BadRequest(format!("Invalid path or permission denied: {}", e)))?;
    if !state.store.add_location(Arc::new(backend)) {
        return Err(AppError::Conflict("Storage location already exists".into()));
    }
    state.persist_locations().await?;
    tracing::info!(path = %path, "Storage location added");
    Ok(success())
}

#[derive(Deserialize)]
pub struct SetActiveRequest {
    pub index: usize,
}

async fn set_active_storage(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetActiveRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.set_active(body.index)?;
    state.persist_locations().await?;
    tracing::info!(index = body.index, "Active storage location changed");
    Ok(success())
}

async fn remove_storage(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.store.remove_location(index)?;
    state.persist_locations().await?;
    tracing::info!(path = %removed.display(), "Storage location removed");
    Ok(success())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub day: String,
    pub version_id: String,
    pub path: String,
    pub created_at: String,
    pub file_count: i64,
    pub total_size: i64,
}

impl From<VersionRecord> for BackupSummary {
    fn from(v: VersionRecord) -> Self {
        Self {
            day: v.day_folder,
            version_id: v.version_id,
            path: v.path,
            created_at: v.created_at,
            file_count: v.file_count,
            total_size: v.total_bytes,
        }
    }
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupSummary>>, AppError> {
    let versions = catalog::all_versions(&state).await?;
    Ok(Json(versions.into_iter().map(BackupSummary::from).collect()))
}

async fn find_in_day(state: &AppState, day: &str, version_id: &str) -> Result<VersionRecord, AppError> {
    match state.meta.version(version_id).await? {
        Some(v) if v.day_folder == day => Ok(v),
        _ => Err(AppError::NotFound("Backup not found".into())),
    }
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path((day, version_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = find_in_day(&state, &day, &version_id).await?;
    let manifest = match resolve_version_path(&state.config.data_root, &record.path) {
        Some(dir) => version_manifest::read(&dir).await?,
        None => None,
    };
    Ok(Json(serde_json::json!({
        "version": record,
        "manifest": manifest,
    })))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path((day, version_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    find_in_day(&state, &day, &version_id).await?;
    let deleted = state
        .meta
        .delete_version(&version_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Backup not found".into()))?;

    catalog::remove_version_dir(&state, &deleted.version.path).await;
    if deleted.day_removed {
        catalog::remove_day_dir(&state, &day).await;
    }
    tracing::info!(version_id = %version_id, day_removed = deleted.day_removed, "Version deleted");
    Ok(success())
}

async fn delete_day(
    State(state): State<Arc<AppState>>,
    Path(day): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !is_plain_segment(&day) {
        return Err(AppError::BadRequest("invalid day".into()));
    }
    let removed = state
        .meta
        .delete_day(&day)
        .await?
        .ok_or_else(|| AppError::NotFound("Day not found".into()))?;

    for version in &removed {
        catalog::remove_version_dir(&state, &version.path).await;
    }
    catalog::remove_day_dir(&state, &day).await;
    tracing::info!(day = %day, versions = removed.len(), "Day deleted");
    Ok(success())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneRequest {
    #[serde(default = "default_prune_hours")]
    pub older_than_hours: i64,
}

const MAX_PRUNE_HOURS: i64 = 24 * 365 * 100;

fn default_prune_hours() -> i64 {
    24
}

async fn prune_sessions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PruneRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.older_than_hours < 0 {
        return Err(AppError::BadRequest("olderThanHours must not be negative".into()));
    }
    let cutoff = chrono::Utc::now() - chrono::Duration::hours(body.older_than_hours.min(MAX_PRUNE_HOURS));
    let pruned = state.meta.prune_sessions(cutoff).await?;

    // Only versions that were never committed lose their directory
    for session in &pruned {
        if state.meta.version(&session.version_id).await?.is_none() {
            catalog::remove_version_dir(&state, &session.version_path).await;
        }
    }
    tracing::info!(pruned = pruned.len(), "Stale sessions pruned");
    Ok(Json(serde_json::json!({ "pruned": pruned.len() })))
}
