//! Lifecycle notifications emitted while a run progresses.
//!
//! Delivery is best effort: with no subscriber, or a subscriber that falls
//! behind the channel capacity, events are dropped. Nothing in a run depends
//! on them.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    RunStarted {
        root: String,
        receiver: String,
    },
    ScanProgress {
        current: u64,
        total: u64,
    },
    FileUploaded {
        relpath: String,
        size: u64,
    },
    UploadFailed {
        relpath: String,
        error: String,
    },
    RunCompleted {
        version_id: String,
        day_index: u32,
        files: u64,
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
