//! Bounded retry of a fallible async operation.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause after every failed attempt
    Fixed(Duration),
    /// Pause grows by this step: step, 2*step, 3*step...
    Linear(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Pause after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Linear(step) => step * attempt,
        }
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. The last error is returned.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts && should_retry(&e) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!("{} failed (attempt {}/{}): {}", label, attempt, policy.attempts, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`retry_if`] that retries every error.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(policy, label, |_| true, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays() {
        let linear = RetryPolicy::new(3, Backoff::Linear(Duration::from_secs(1)));
        assert_eq!(linear.delay_after(1), Duration::from_secs(1));
        assert_eq!(linear.delay_after(2), Duration::from_secs(2));

        let fixed = RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(5)));
        assert_eq!(fixed.delay_after(2), Duration::from_millis(5));
        assert_eq!(RetryPolicy::new(0, Backoff::Fixed(Duration::ZERO)).attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1)));
        let result: Result<u32, String> = retry(policy, "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("boom {}", attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let policy = RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(1)));
        let result: Result<(), String> =
            retry(policy, "op", |attempt| async move { Err(format!("fail {}", attempt)) }).await;
        assert_eq!(result, Err("fail 2".to_string()));
    }

    #[tokio::test]
    async fn test_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Backoff::Fixed(Duration::from_millis(1)));
        let result: Result<(), String> = retry_if(policy, "op", |e: &String| e != "fatal", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
