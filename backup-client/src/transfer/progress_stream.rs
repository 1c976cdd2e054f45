//! Byte-counting wrapper around an upload body stream.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Receives the number of bytes sent since the previous call.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream wrapper that reports bytes as they are handed to the HTTP client.
///
/// Reports are throttled to one per `update_interval`; whatever is still
/// unreported is flushed when the inner stream ends or fails, so the deltas
/// always add up to the bytes yielded.
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    bytes_reported: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            bytes_reported: 0,
            last_update: Instant::now(),
            update_interval: Duration::from_millis(250),
            callback,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    fn flush(&mut self) {
        let delta = self.bytes_transferred - self.bytes_reported;
        if delta > 0 {
            (self.callback)(delta);
            self.bytes_reported = self.bytes_transferred;
        }
        self.last_update = Instant::now();
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;
                if self.last_update.elapsed() >= self.update_interval {
                    self.flush();
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.flush();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.flush();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_deltas_sum_to_total() {
        let reported = Arc::new(AtomicU64::new(0));
        let sink = reported.clone();
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let mut wrapped = ProgressStream::new(
            stream::iter(chunks),
            Arc::new(move |n: u64| {
                sink.fetch_add(n, Ordering::SeqCst);
            }),
        );

        let mut body = Vec::new();
        while let Some(chunk) = wrapped.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"hello world");
        assert_eq!(wrapped.bytes_transferred(), 11);
        assert_eq!(reported.load(Ordering::SeqCst), 11);
    }
}
