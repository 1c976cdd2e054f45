use crate::utils::retry::{retry, Backoff, RetryPolicy};
use backup_protocol::ContentHash;
use std::path::Path;
use std::time::Duration;

pub const HASH_ATTEMPTS: u32 = 3;

pub fn hash_policy() -> RetryPolicy {
    RetryPolicy::new(HASH_ATTEMPTS, Backoff::Linear(Duration::from_secs(1)))
}

/// SHA-256 of a whole file, read on a blocking thread. Read failures are
/// retried per `policy`.
pub async fn hash_with_retry(path: &Path, policy: RetryPolicy) -> std::io::Result<ContentHash> {
    let label = format!("Hashing {}", path.display());
    retry(policy, &label, |_| {
        let path = path.to_path_buf();
        async move {
            tokio::task::spawn_blocking(move || backup_protocol::hash_file(&path))
                .await
                .map_err(std::io::Error::other)?
        }
    })
    .await
}
