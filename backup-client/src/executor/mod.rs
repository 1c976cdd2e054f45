//! Backup run executor.
//!
//! One run walks a source directory, hashes every file, negotiates with the
//! receiver which content it still lacks, uploads that content with a small
//! worker pool and finally commits the version:
//!
//! 1. scan: walk the tree, apply exclusions, check readability
//! 2. hash: SHA-256 per file, sequentially, retried on read errors
//! 3. init: send the manifest, get back the missing hashes
//! 4. upload: `parallel_uploads` workers drain a shared hash queue; each
//!    upload resumes from the receiver's current offset and is retried as a
//!    whole on failure
//! 5. commit: the manifest minus files whose upload failed

pub mod guard;
pub mod manifest;

use crate::api::{ReceiverClient, UploadTarget};
use crate::config::{local_hostname, Config};
use crate::events::{EventBus, SyncEvent};
use crate::fs::hasher::{hash_policy, hash_with_retry};
use crate::fs::{scan_tree, ExcludeSet, ScanError};
use crate::transfer::{
    format_bytes, format_duration, format_speed, ProgressCallback, RunCounters, RunStats,
};
use crate::utils::errors::{ClientError, Result};
use crate::utils::retry::{retry_if, Backoff, RetryPolicy};
use backup_protocol::wire::{CommitRequest, InitBackupRequest};
use backup_protocol::ContentHash;
use guard::RunGuard;
use manifest::HashedFile;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub root: PathBuf,
    pub date: String,
    pub day_index: u32,
    pub version_id: String,
    pub version_path: String,
    pub stats: RunStats,
    /// Files dropped before `init` because they could not be read or hashed
    pub scan_errors: Vec<ScanError>,
    /// Relative paths left out of the commit because their upload failed
    pub failed_uploads: Vec<String>,
    pub duration_ms: u64,
}

/// Drives backup runs against one receiver.
pub struct SyncEngine {
    client: ReceiverClient,
    excludes: ExcludeSet,
    client_id: String,
    parallel_uploads: usize,
    upload_policy: RetryPolicy,
    hash_policy: RetryPolicy,
    events: EventBus,
    guard: RunGuard,
}

/// What one file upload ended up doing.
enum Uploaded {
    /// Bytes were sent, counted from the resume offset
    Sent(u64),
    /// The receiver already held the whole blob
    AlreadyStored,
}

/// State shared by the upload workers of one run.
struct UploadContext {
    client: ReceiverClient,
    events: EventBus,
    counters: Arc<RunCounters>,
    version_id: String,
    policy: RetryPolicy,
    queue: Mutex<VecDeque<ContentHash>>,
    files: HashMap<ContentHash, HashedFile>,
    failed: Mutex<HashSet<ContentHash>>,
}

impl SyncEngine {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: ReceiverClient::new(&config.server)?,
            excludes: ExcludeSet::new(&config.backup.exclusions)
                .map_err(|e| ClientError::Config(format!("invalid exclusion pattern: {}", e)))?,
            client_id: config.backup.client_id(),
            parallel_uploads: config.backup.parallel_uploads.max(1),
            upload_policy: RetryPolicy::new(
                config.server.retry_attempts,
                Backoff::Fixed(config.server.retry_delay()),
            ),
            hash_policy: hash_policy(),
            events: EventBus::new(),
            guard: RunGuard::default(),
        })
    }

    /// Overrides the read-retry policy used while hashing.
    pub fn with_hash_policy(mut self, policy: RetryPolicy) -> Self {
        self.hash_policy = policy;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn client(&self) -> &ReceiverClient {
        &self.client
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Backs up `source` as one new version.
    ///
    /// Returns [`ClientError::RunInProgress`] straight away if another run on
    /// this engine has not finished. Any other failure is logged, announced
    /// as [`SyncEvent::RunFailed`] and returned.
    pub async fn run(&self, source: &Path) -> Result<RunReport> {
        let _permit = self.guard.try_acquire().inspect_err(|_| {
            warn!("Backup already running, rejecting run for {}", source.display());
        })?;

        let started = Instant::now();
        let result = self.execute(source, started).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(report) => {
                let speed = report.stats.uploaded_bytes * 1000 / duration_ms.max(1);
                info!(
                    "Backup completed in {}: version={}, day {}, {} files, {} uploaded ({})",
                    format_duration(duration_ms / 1000),
                    report.version_id,
                    report.day_index,
                    report.stats.processed_files,
                    format_bytes(report.stats.uploaded_bytes),
                    format_speed(speed)
                );
                self.events.emit(SyncEvent::RunCompleted {
                    version_id: report.version_id.clone(),
                    day_index: report.day_index,
                    files: report.stats.processed_files,
                    duration_ms,
                });
            }
            Err(e) => {
                error!("Backup of {} failed: {}", source.display(), e);
                self.events.emit(SyncEvent::RunFailed {
                    error: e.to_string(),
                    duration_ms,
                });
            }
        }
        result
    }

    async fn execute(&self, source: &Path, started: Instant) -> Result<RunReport> {
        let root = tokio::fs::canonicalize(source).await?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            )));
        }
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let counters = Arc::new(RunCounters::default());

        info!("Starting backup: {} -> {}", root.display(), self.client.base_url());
        self.events.emit(SyncEvent::RunStarted {
            root: root.display().to_string(),
            receiver: self.client.base_url().to_string(),
        });

        let (files, scan_errors) = self.scan_and_hash(&root, &counters).await?;
        if files.is_empty() {
            warn!("No files to back up under {}", root.display());
            return Err(ClientError::NothingToBackUp(root.display().to_string()));
        }
        info!(
            "Found {} files ({}), {} scan errors",
            files.len(),
            format_bytes(counters.snapshot().total_bytes),
            scan_errors.len()
        );

        let init = self
            .client
            .init(&InitBackupRequest {
                date: date.clone(),
                client_id: self.client_id.clone(),
                manifest: files.iter().map(HashedFile::entry).collect(),
            })
            .await?;
        info!(
            "Receiver ready: version={}, day {}, missing={} hashes",
            init.version_id,
            init.day_index,
            init.missing_hashes.len()
        );

        let failed = if init.missing_hashes.is_empty() {
            HashSet::new()
        } else {
            self.upload_missing(&files, init.missing_hashes, &init.version_id, &counters)
                .await
        };

        let manifest = manifest::entries(&files, &failed);
        if manifest.is_empty() {
            return Err(ClientError::UploadsFailed(failed.len()));
        }
        let failed_uploads: Vec<String> = files
            .iter()
            .filter(|f| failed.contains(&f.sha))
            .map(|f| f.relpath.clone())
            .collect();
        if !failed_uploads.is_empty() {
            warn!("Committing without {} files whose upload failed", failed_uploads.len());
        }

        let mut extra = serde_json::Map::new();
        extra.insert("host".into(), local_hostname().into());
        extra.insert("client".into(), concat!("backup-client/", env!("CARGO_PKG_VERSION")).into());
        extra.insert("failedUploads".into(), failed_uploads.len().into());
        extra.insert("scanErrors".into(), scan_errors.len().into());

        info!("Committing backup ({} files)...", manifest.len());
        let committed = self
            .client
            .commit(&CommitRequest {
                session_key: init.session_key,
                manifest,
                extra,
            })
            .await?;

        Ok(RunReport {
            root,
            date,
            day_index: init.day_index,
            version_id: committed.version_id,
            version_path: committed.version_path,
            stats: counters.snapshot(),
            scan_errors,
            failed_uploads,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Walks the tree on a blocking thread, then hashes the candidates one by
    /// one. Files that cannot be hashed become scan errors.
    async fn scan_and_hash(
        &self,
        root: &Path,
        counters: &RunCounters,
    ) -> Result<(Vec<HashedFile>, Vec<ScanError>)> {
        info!("Scanning files...");
        let walk_root = root.to_path_buf();
        let excludes = self.excludes.clone();
        let scan = tokio::task::spawn_blocking(move || scan_tree(&walk_root, &excludes, |_| {}))
            .await
            .map_err(|e| ClientError::Io(std::io::Error::other(e)))?;

        let total = scan.candidates.len() as u64;
        RunCounters::add(&counters.total_files, total);
        RunCounters::add(&counters.skipped_files, scan.skipped);
        RunCounters::add(&counters.total_bytes, scan.total_bytes());
        info!(
            "Scan complete. Found {} files, excluded {} files and {} directories",
            total, scan.skipped, scan.pruned_dirs
        );

        let mut errors = scan.errors;
        let mut files = Vec::with_capacity(scan.candidates.len());
        for (i, candidate) in scan.candidates.into_iter().enumerate() {
            match hash_with_retry(&candidate.full_path, self.hash_policy).await {
                Ok(sha) => {
                    RunCounters::add(&counters.processed_files, 1);
                    files.push(HashedFile::new(candidate, sha));
                }
                Err(e) => {
                    error!("Hash calculation failed: {}: {}", candidate.relative_path, e);
                    RunCounters::add(&counters.errors, 1);
                    errors.push(ScanError {
                        path: candidate.relative_path,
                        error: format!("hash calculation failed: {}", e),
                    });
                }
            }
            self.events.emit(SyncEvent::ScanProgress {
                current: i as u64 + 1,
                total,
            });
        }
        Ok((files, errors))
    }

    /// Runs the worker pool over `missing` and returns the hashes whose
    /// upload failed for good.
    async fn upload_missing(
        &self,
        files: &[HashedFile],
        missing: Vec<ContentHash>,
        version_id: &str,
        counters: &Arc<RunCounters>,
    ) -> HashSet<ContentHash> {
        let workers = self.parallel_uploads.min(missing.len());
        info!("Uploading {} missing hashes with {} workers", missing.len(), workers);

        let ctx = Arc::new(UploadContext {
            client: self.client.clone(),
            events: self.events.clone(),
            counters: counters.clone(),
            version_id: version_id.to_string(),
            policy: self.upload_policy,
            queue: Mutex::new(missing.into_iter().collect()),
            files: manifest::by_hash(files)
                .into_iter()
                .map(|(sha, file)| (sha, file.clone()))
                .collect(),
            failed: Mutex::new(HashSet::new()),
        });

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            tasks.spawn(upload_worker(ctx.clone(), id));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Upload worker panicked: {}", e);
            }
        }

        let failed = ctx.failed.lock().await.clone();
        failed
    }
}

async fn upload_worker(ctx: Arc<UploadContext>, id: usize) {
    loop {
        let next = ctx.queue.lock().await.pop_front();
        let Some(sha) = next else { break };
        let Some(file) = ctx.files.get(&sha) else {
            warn!("Receiver requested unknown hash: {}", sha);
            continue;
        };

        match upload_file(&ctx, file).await {
            Ok(Uploaded::Sent(bytes)) => {
                debug!("Worker {} uploaded {} ({} bytes sent)", id, file.relpath, bytes);
                RunCounters::add(&ctx.counters.uploaded_files, 1);
                ctx.events.emit(SyncEvent::FileUploaded {
                    relpath: file.relpath.clone(),
                    size: file.size,
                });
            }
            Ok(Uploaded::AlreadyStored) => {
                debug!("Already uploaded: {}", file.relpath);
            }
            Err(e) => {
                error!("Upload failed after retries: {}: {}", file.relpath, e);
                RunCounters::add(&ctx.counters.errors, 1);
                ctx.failed.lock().await.insert(sha);
                ctx.events.emit(SyncEvent::UploadFailed {
                    relpath: file.relpath.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Uploads one file. An attempt starts from the offset the receiver reported
/// with its last rejection, or asks the receiver how much it holds.
async fn upload_file(ctx: &UploadContext, file: &HashedFile) -> Result<Uploaded> {
    let target = UploadTarget {
        sha: &file.sha,
        relpath: &file.relpath,
        version_id: &ctx.version_id,
    };
    let label = format!("Upload of {}", file.relpath);
    let reported = StdMutex::new(None::<u64>);

    retry_if(ctx.policy, &label, ClientError::is_retryable, |attempt| {
        let target = target.clone();
        let reported = &reported;
        async move {
            let hint = reported.lock().unwrap_or_else(|e| e.into_inner()).take();
            let start = match hint {
                Some(bytes) => bytes,
                None => {
                    let offset = ctx.client.file_offset(&file.sha, file.size).await?;
                    if offset.exists && offset.bytes >= file.size {
                        return Ok(Uploaded::AlreadyStored);
                    }
                    offset.bytes
                }
            };

            if start > 0 {
                info!(
                    "Resuming {} at byte {} of {} (attempt {})",
                    file.relpath, start, file.size, attempt
                );
            } else {
                info!("Uploading {} ({})", file.relpath, format_bytes(file.size));
            }

            let counters = ctx.counters.clone();
            let progress: ProgressCallback =
                Arc::new(move |n: u64| RunCounters::add(&counters.uploaded_bytes, n));
            let sent = ctx
                .client
                .upload(&target, &file.full_path, start, file.size, progress)
                .await;
            match sent {
                Ok(_) => Ok(Uploaded::Sent(file.size.saturating_sub(start))),
                Err(ClientError::OffsetGap { bytes }) => {
                    *reported.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes);
                    Err(ClientError::OffsetGap { bytes })
                }
                Err(e) => Err(e),
            }
        }
    })
    .await
}
