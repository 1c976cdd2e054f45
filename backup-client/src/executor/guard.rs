use crate::utils::errors::{ClientError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Allows one run at a time; a second caller is turned away, not queued.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

/// Held for the duration of a run. Dropping it frees the guard.
#[derive(Debug)]
pub struct RunPermit {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn try_acquire(&self) -> Result<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ClientError::RunInProgress)?;
        Ok(RunPermit {
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_rejected_until_drop() {
        let guard = RunGuard::default();
        let permit = guard.try_acquire().unwrap();
        assert!(guard.is_running());
        assert!(matches!(guard.try_acquire(), Err(ClientError::RunInProgress)));

        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_ok());
    }
}
