//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The daemon stops scheduling new runs on a signal and gives a run that is
//! already uploading a grace period to finish.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// How often the grace period checks whether the run has finished.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM or SIGINT, then tell every subscriber.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.trigger();
    }

    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
    }

    /// Waits until `busy` reports false or `grace` runs out. Returns whether
    /// everything went idle in time.
    pub async fn drain<F>(&self, grace: Duration, busy: F) -> bool
    where
        F: Fn() -> bool,
    {
        info!("Graceful shutdown initiated");
        let deadline = tokio::time::Instant::now() + grace;
        while busy() {
            if tokio::time::Instant::now() >= deadline {
                warn!("Backup still running after {:?}, exiting anyway", grace);
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        info!("Graceful shutdown complete");
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
