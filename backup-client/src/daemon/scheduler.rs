//! Timed backup runs.

use crate::executor::SyncEngine;
use crate::utils::errors::{ClientError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Turns a local `HH:MM` time into a daily six-field cron expression.
pub fn cron_for(time: &str) -> Result<String> {
    let invalid = || ClientError::Config(format!("invalid schedule time {:?}, expected HH:MM", time));
    let (hour, minute) = time.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(format!("0 {} {} * * *", minute, hour))
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    engine: Arc<SyncEngine>,
    sources: Arc<Vec<PathBuf>>,
}

impl BackupScheduler {
    pub async fn new(engine: Arc<SyncEngine>, sources: Vec<PathBuf>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| ClientError::Scheduler(e.to_string()))?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            engine,
            sources: Arc::new(sources),
        })
    }

    /// Adds one daily job firing at `time` (local clock).
    pub async fn schedule_daily(&self, time: &str) -> Result<()> {
        let cron = cron_for(time)?;
        let engine = self.engine.clone();
        let sources = self.sources.clone();
        let label = time.to_string();

        let job = Job::new_async_tz(cron.as_str(), chrono::Local, move |_uuid, _lock| {
            let engine = engine.clone();
            let sources = sources.clone();
            let label = label.clone();
            Box::pin(async move {
                if engine.is_running() {
                    tracing::warn!(time = %label, "Skipping scheduled run: backup already running");
                    return;
                }
                tracing::info!(time = %label, sources = sources.len(), "Starting scheduled backup");
                run_sources(&engine, &sources).await;
            })
        })
        .map_err(|e| ClientError::Scheduler(e.to_string()))?;

        self.scheduler
            .lock()
            .await
            .add(job)
            .await
            .map_err(|e| ClientError::Scheduler(e.to_string()))?;
        tracing::info!(time = %time, cron = %cron, "Backup scheduled");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler
            .lock()
            .await
            .start()
            .await
            .map_err(|e| ClientError::Scheduler(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| ClientError::Scheduler(e.to_string()))
    }
}

/// Backs up each source in turn. A failed or rejected source does not stop
/// the others.
pub async fn run_sources(engine: &SyncEngine, sources: &[PathBuf]) {
    for source in sources {
        match engine.run(source).await {
            Ok(report) => tracing::info!(
                source = %source.display(),
                version_id = %report.version_id,
                day_index = report.day_index,
                "Scheduled backup finished"
            ),
            Err(e) => tracing::error!(source = %source.display(), error = %e, "Scheduled backup failed"),
        }
    }
}
