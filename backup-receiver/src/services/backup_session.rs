//! Receiver side of a backup run: init, per-hash uploads, commit.

use crate::error::{join_error, AppError};
use crate::models::session::Session;
use crate::services::metadata::{timestamp, CommitSummary, SessionClaim};
use crate::services::version_manifest::{self, FileEntry, ManifestMetadata, VersionManifest};
use crate::state::AppState;
use crate::store::{StoreError, UploadOutcome};
use crate::utils::paths::resolve_version_path;
use backup_protocol::wire::{
    CommitRequest, CommitResponse, FileOffsetResponse, HasHashesResponse, InitBackupRequest,
    InitBackupResponse, ManifestEntry, UploadResponse, UploadStatus,
};
use backup_protocol::ContentHash;
use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use futures_util::Stream;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

fn check_unique_paths(manifest: &[ManifestEntry]) -> Result<(), AppError> {
    let mut seen = HashSet::with_capacity(manifest.len());
    for entry in manifest {
        if entry.relpath.is_empty() {
            return Err(AppError::BadRequest("manifest entry with empty relpath".into()));
        }
        if !seen.insert(entry.relpath.as_str()) {
            return Err(AppError::BadRequest(format!(
                "duplicate relpath in manifest: {}",
                entry.relpath
            )));
        }
    }
    Ok(())
}

/// Hashes with no complete blob in any location, first occurrence order.
async fn incomplete_hashes(state: &AppState, manifest: &[ManifestEntry]) -> Result<Vec<ContentHash>, AppError> {
    let store = state.store.clone();
    let wanted: Vec<(ContentHash, u64)> = manifest.iter().map(|e| (e.sha.clone(), e.size)).collect();

    let missing = tokio::task::spawn_blocking(move || {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for (sha, size) in wanted {
            if !seen.insert(sha.clone()) {
                continue;
            }
            if !store.is_complete(&sha, size)? {
                missing.push(sha);
            }
        }
        Ok::<_, std::io::Error>(missing)
    })
    .await
    .map_err(join_error)?
    .map_err(anyhow::Error::from)?;
    Ok(missing)
}

fn version_dir(state: &AppState, version_path: &str) -> Result<PathBuf, AppError> {
    resolve_version_path(&state.config.data_root, version_path)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("stored version path is invalid: {}", version_path)))
}

pub async fn init_backup(state: &AppState, req: InitBackupRequest) -> Result<InitBackupResponse, AppError> {
    if NaiveDate::parse_from_str(&req.date, "%Y-%m-%d").is_err() {
        return Err(AppError::BadRequest("date must be YYYY-MM-DD".into()));
    }
    let client_id = req.client_id.trim();
    if client_id.is_empty() {
        return Err(AppError::BadRequest("clientId required".into()));
    }
    check_unique_paths(&req.manifest)?;

    let missing = incomplete_hashes(state, &req.manifest).await?;
    let session = state.meta.create_session(client_id, &req.date, Utc::now()).await?;

    let dir = version_dir(state, &session.version_path)?;
    tokio::fs::create_dir_all(&dir).await.map_err(anyhow::Error::from)?;

    tracing::info!(
        client_id = %client_id,
        version_id = %session.version_id,
        day_index = session.day_index,
        files = req.manifest.len(),
        missing = missing.len(),
        "Backup session opened"
    );

    Ok(InitBackupResponse {
        day_index: session.day_index,
        version_id: session.version_id,
        version_path: session.version_path,
        missing_hashes: missing,
        session_key: session.session_key,
    })
}

/// Query parameters identifying one upload.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub sha: ContentHash,
    pub relpath: String,
    pub version_id: String,
}

pub async fn upload<S, E>(
    state: &AppState,
    target: UploadTarget,
    start_byte: u64,
    declared_size: Option<u64>,
    body: S,
) -> Result<UploadResponse, AppError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    if target.relpath.is_empty() {
        return Err(AppError::BadRequest("sha, relpath, versionId required".into()));
    }
    let session = state
        .meta
        .session_by_version(&target.version_id)
        .await?
        .ok_or_else(|| AppError::BadRequest("unknown versionId".into()))?;

    let outcome = state
        .store
        .accept_upload(&target.sha, start_byte, declared_size, body)
        .await
        .map_err(|e| match e {
            StoreError::Integrity { computed } => AppError::HashMismatch { computed },
            StoreError::OffsetGap { stored, offered } => AppError::OffsetGap {
                message: format!("start byte {} is past the {} bytes stored", offered, stored),
                bytes: stored,
            },
            StoreError::Body { stored, message } => {
                tracing::warn!(hash = %target.sha, stored, "Upload stream interrupted: {}", message);
                AppError::BadRequest(format!("upload interrupted: {}", message))
            }
            StoreError::Io(e) => AppError::Internal(e.into()),
        })?;

    let (status, size) = match outcome {
        UploadOutcome::Stored { size } => (UploadStatus::Ok, size),
        UploadOutcome::Exists { size } => (UploadStatus::Exists, size),
        UploadOutcome::Incomplete { size } => {
            return Err(AppError::OffsetGap {
                message: "upload incomplete".into(),
                bytes: size,
            })
        }
    };

    state
        .meta
        .record_provisional_file(&session.session_key, &target.relpath, target.sha.as_str())
        .await?;

    tracing::debug!(hash = %target.sha, relpath = %target.relpath, size, ?status, "Upload accepted");

    Ok(UploadResponse {
        status,
        sha: Some(target.sha),
        bytes: Some(size),
    })
}

pub async fn commit(state: &AppState, req: CommitRequest) -> Result<CommitResponse, AppError> {
    check_unique_paths(&req.manifest)?;
    let session = match state.meta.claim_session(&req.session_key).await? {
        SessionClaim::Claimed(session) => session,
        SessionClaim::Busy => return Err(AppError::Conflict("commit already in progress".into())),
        SessionClaim::Unknown => return Err(AppError::BadRequest("invalid sessionKey".into())),
    };

    let result = commit_claimed(state, &session, req).await;
    if result.is_err() {
        if let Err(e) = state.meta.release_session(&session.session_key).await {
            tracing::error!(version_id = %session.version_id, "Failed to release session: {e:#}");
        }
    }
    result
}

/// Paths the client uploaded under one hash but commits under another.
fn conflicting_uploads(provisional: &[(String, String)], files: &BTreeMap<String, FileEntry>) -> Vec<String> {
    provisional
        .iter()
        .filter(|(relpath, sha)| files.get(relpath).is_some_and(|f| f.sha.as_str() != sha))
        .map(|(relpath, _)| relpath.clone())
        .collect()
}

/// Runs with the session claimed. On error nothing is registered and any
/// manifest written here is removed again.
async fn commit_claimed(state: &AppState, session: &Session, req: CommitRequest) -> Result<CommitResponse, AppError> {
    let missing = incomplete_hashes(state, &req.manifest).await?;
    if !missing.is_empty() {
        tracing::warn!(
            version_id = %session.version_id,
            missing = missing.len(),
            "Commit refused, content not fully stored"
        );
        return Err(AppError::MissingContent {
            message: format!("{} referenced hashes are not stored", missing.len()),
            missing,
        });
    }

    let files: BTreeMap<String, FileEntry> = req
        .manifest
        .iter()
        .map(|e| {
            (
                e.relpath.clone(),
                FileEntry {
                    sha: e.sha.clone(),
                    size: e.size,
                    mtime: e.mtime,
                },
            )
        })
        .collect();

    let provisional = state.meta.provisional_files(&session.session_key).await?;
    let conflicts = conflicting_uploads(&provisional, &files);
    if let Some(first) = conflicts.first() {
        return Err(AppError::Unprocessable(format!(
            "{} paths were uploaded with different content than committed, first: {}",
            conflicts.len(),
            first
        )));
    }
    let unlisted = provisional.iter().filter(|(relpath, _)| !files.contains_key(relpath)).count();
    if unlisted > 0 {
        tracing::info!(version_id = %session.version_id, unlisted, "Uploaded paths left out of the final manifest");
    }

    let created_at = timestamp(Utc::now());
    let manifest = VersionManifest {
        metadata: ManifestMetadata {
            date: session.date.clone(),
            day_index: session.day_index,
            version_id: session.version_id.clone(),
            created_at: created_at.clone(),
            extra: req.extra.clone(),
        },
        files,
    };
    let dir = version_dir(state, &session.version_path)?;
    version_manifest::write(&dir, &manifest).await?;

    let summary = CommitSummary {
        file_count: manifest.files.len() as i64,
        total_bytes: manifest.total_bytes() as i64,
        extra: serde_json::Value::Object(req.extra),
        created_at,
    };
    let registered = match state.meta.commit_session(&session.session_key, summary).await {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(AppError::BadRequest("invalid sessionKey".into())),
        Err(e) => Err(AppError::Internal(e)),
    };
    let record = match registered {
        Ok(record) => record,
        Err(e) => {
            if let Err(rm) = version_manifest::remove(&dir).await {
                tracing::warn!(version_id = %session.version_id, "Could not remove unregistered manifest: {rm:#}");
            }
            return Err(e);
        }
    };

    tracing::info!(
        version_id = %record.version_id,
        day = %record.day_folder,
        files = record.file_count,
        bytes = record.total_bytes,
        "Version committed"
    );

    Ok(CommitResponse {
        status: "committed".into(),
        version_id: record.version_id,
        version_path: record.path,
    })
}

/// Existence of each requested hash. Strings that are not valid hashes are
/// reported as absent.
pub fn has_hashes(state: &AppState, shas: &[String]) -> HasHashesResponse {
    shas.iter()
        .map(|raw| {
            let present = raw
                .parse::<ContentHash>()
                .map(|h| state.store.has(&h))
                .unwrap_or(false);
            (raw.clone(), present)
        })
        .collect()
}

/// Where an upload of `sha` should start. `expected` is the full file size
/// when the client knows it.
pub fn file_offset(
    state: &AppState,
    sha: &ContentHash,
    expected: Option<u64>,
) -> Result<FileOffsetResponse, AppError> {
    let size = state
        .store
        .resume_offset(sha, expected)
        .map_err(anyhow::Error::from)?;
    Ok(FileOffsetResponse {
        exists: size.is_some(),
        bytes: size.unwrap_or(0),
    })
}
