//! Read-only views over committed versions: search and statistics.

use crate::models::version::VersionRecord;
use crate::services::version_manifest;
use crate::state::AppState;
use crate::utils::paths::resolve_version_path;
use serde::Serialize;

pub const SEARCH_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub date_folder: String,
    pub version_id: String,
    pub version_path: String,
    pub relpath: String,
    pub sha: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_backups: i64,
    pub total_storage: u64,
    pub total_files: u64,
}

/// Case-insensitive substring match on relative paths across every committed
/// manifest, oldest version first, stopping at [`SEARCH_LIMIT`] matches.
pub async fn search(state: &AppState, query: &str) -> anyhow::Result<Vec<SearchMatch>> {
    let needle = query.to_lowercase();
    let mut matches = Vec::new();

    for (day, versions) in state.meta.days_with_versions().await? {
        for version in versions {
            let Some(dir) = resolve_version_path(&state.config.data_root, &version.path) else {
                continue;
            };
            let manifest = match version_manifest::read(&dir).await {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(version_id = %version.version_id, "Skipping unreadable manifest: {:#}", e);
                    continue;
                }
            };
            for (relpath, entry) in manifest.files {
                if !relpath.to_lowercase().contains(&needle) {
                    continue;
                }
                matches.push(SearchMatch {
                    date_folder: day.folder.clone(),
                    version_id: version.version_id.clone(),
                    version_path: version.path.clone(),
                    relpath,
                    sha: entry.sha.to_string(),
                    size: entry.size,
                });
                if matches.len() >= SEARCH_LIMIT {
                    return Ok(matches);
                }
            }
        }
    }
    Ok(matches)
}

pub async fn stats(state: &AppState) -> anyhow::Result<Stats> {
    let total_backups = state.meta.count_versions().await?;
    let store = state.store.clone();
    let usage = tokio::task::spawn_blocking(move || store.stats())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Stats {
        total_backups,
        total_storage: usage.bytes,
        total_files: usage.blobs,
    })
}

/// Every committed version, newest first.
pub async fn all_versions(state: &AppState) -> anyhow::Result<Vec<VersionRecord>> {
    let mut versions: Vec<VersionRecord> = state
        .meta
        .days_with_versions()
        .await?
        .into_iter()
        .flat_map(|(_, versions)| versions)
        .collect();
    versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(versions)
}

/// Removes a version directory; metadata has already been deleted.
pub async fn remove_version_dir(state: &AppState, version_path: &str) {
    let Some(dir) = resolve_version_path(&state.config.data_root, version_path) else {
        return;
    };
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove version directory {}: {}", dir.display(), e),
    }
}

/// Removes a day directory once it no longer holds any version.
pub async fn remove_day_dir(state: &AppState, folder: &str) {
    let dir = state.config.backups_dir.join(folder);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove day directory {}: {}", dir.display(), e),
    }
}
