//! Content-addressed blob store spread over one or more storage locations.
//!
//! Every location is searched for reads and existence checks; only the active
//! location receives new bytes. A blob shorter than the file it represents is
//! a resumable prefix. Once its length reaches the declared file size it is
//! re-hashed from disk and either accepted or removed.

pub mod backend;

pub use backend::{DirectoryBackend, StorageBackend};

use backup_protocol::{hash_file, ContentHash};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("hash mismatch: stored bytes hash to {computed}")]
    Integrity { computed: ContentHash },

    #[error("resume offset {offered} is past the {stored} bytes already stored")]
    OffsetGap { stored: u64, offered: u64 },

    #[error("upload stream failed with {stored} bytes stored: {message}")]
    Body { stored: u64, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("Invalid storage index")]
    InvalidIndex,
    #[error("Cannot remove last storage location")]
    LastLocation,
    #[error("Cannot remove active storage location")]
    ActiveLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// New bytes were appended and the full blob verified
    Stored { size: u64 },
    /// A complete, verified blob was already present
    Exists { size: u64 },
    /// Bytes were appended but the blob is still shorter than the file
    Incomplete { size: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub blobs: u64,
    pub bytes: u64,
}

struct Locations {
    backends: Vec<Arc<dyn StorageBackend>>,
    active: usize,
}

pub struct ContentStore {
    locations: RwLock<Locations>,
    /// Serializes uploads of the same hash within this process
    upload_locks: DashMap<ContentHash, Arc<Mutex<()>>>,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roots, active) = self.locations();
        f.debug_struct("ContentStore")
            .field("locations", &roots)
            .field("active", &active)
            .finish()
    }
}

impl ContentStore {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>, active: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(!backends.is_empty(), "at least one storage location is required");
        let active = if active < backends.len() { active } else { 0 };
        Ok(Self {
            locations: RwLock::new(Locations { backends, active }),
            upload_locks: DashMap::new(),
        })
    }

    /// Store over plain directories, the first one active.
    pub fn from_dirs(dirs: &[PathBuf], active: usize) -> anyhow::Result<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            backends.push(Arc::new(DirectoryBackend::open(dir)?));
        }
        Self::new(backends, active)
    }

    fn snapshot(&self) -> (Vec<Arc<dyn StorageBackend>>, usize) {
        let guard = self.locations.read().unwrap_or_else(|e| e.into_inner());
        (guard.backends.clone(), guard.active)
    }

    /// Location roots in order plus the active index.
    pub fn locations(&self) -> (Vec<PathBuf>, usize) {
        let (backends, active) = self.snapshot();
        (backends.iter().map(|b| b.root().to_path_buf()).collect(), active)
    }

    pub fn add_location(&self, backend: Arc<dyn StorageBackend>) -> bool {
        let mut guard = self.locations.write().unwrap_or_else(|e| e.into_inner());
        if guard.backends.iter().any(|b| b.root() == backend.root()) {
            return false;
        }
        guard.backends.push(backend);
        true
    }

    pub fn set_active(&self, index: usize) -> Result<(), LocationError> {
        let mut guard = self.locations.write().unwrap_or_else(|e| e.into_inner());
        if index >= guard.backends.len() {
            return Err(LocationError::InvalidIndex);
        }
        guard.active = index;
        Ok(())
    }

    pub fn remove_location(&self, index: usize) -> Result<PathBuf, LocationError> {
        let mut guard = self.locations.write().unwrap_or_else(|e| e.into_inner());
        if guard.backends.len() <= 1 {
            return Err(LocationError::LastLocation);
        }
        if index == guard.active {
            return Err(LocationError::ActiveLocation);
        }
        if index >= guard.backends.len() {
            return Err(LocationError::InvalidIndex);
        }
        let removed = guard.backends.remove(index);
        if guard.active > index {
            guard.active -= 1;
        }
        Ok(removed.root().to_path_buf())
    }

    /// True if any location holds a blob (complete or partial) for `hash`.
    pub fn has(&self, hash: &ContentHash) -> bool {
        let (backends, _) = self.snapshot();
        backends.iter().any(|b| b.has(hash))
    }

    /// On-disk length of the active location's copy, the only one uploads
    /// append to.
    pub fn size(&self, hash: &ContentHash) -> io::Result<Option<u64>> {
        let (backends, active) = self.snapshot();
        backends[active].size(hash)
    }

    /// Length an upload of `hash` resumes from. The active copy wins; a copy
    /// in another location only counts once it holds `expected` bytes, since
    /// nothing appends to it. With no `expected` size any copy counts.
    pub fn resume_offset(&self, hash: &ContentHash, expected: Option<u64>) -> io::Result<Option<u64>> {
        let (backends, active) = self.snapshot();
        if let Some(size) = backends[active].size(hash)? {
            return Ok(Some(size));
        }
        for (i, backend) in backends.iter().enumerate() {
            if i == active {
                continue;
            }
            match (backend.size(hash)?, expected) {
                (Some(size), Some(total)) if size >= total => return Ok(Some(size)),
                (Some(size), None) => return Ok(Some(size)),
                _ => {}
            }
        }
        Ok(None)
    }

    /// True if some location holds at least `expected_size` bytes for `hash`.
    pub fn is_complete(&self, hash: &ContentHash, expected_size: u64) -> io::Result<bool> {
        let (backends, _) = self.snapshot();
        for backend in &backends {
            if let Some(size) = backend.size(hash)? {
                if size >= expected_size {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// First location holding `hash`, with the blob's length there.
    pub fn locate(&self, hash: &ContentHash) -> io::Result<Option<(PathBuf, u64)>> {
        let (backends, _) = self.snapshot();
        for backend in &backends {
            if let Some(size) = backend.size(hash)? {
                return Ok(Some((backend.root().to_path_buf(), size)));
            }
        }
        Ok(None)
    }

    /// Opens the first copy of `hash` positioned at byte `start`.
    pub fn open_range(&self, hash: &ContentHash, start: u64) -> io::Result<Option<std::fs::File>> {
        let (backends, _) = self.snapshot();
        for backend in &backends {
            if backend.has(hash) {
                let mut file = backend.open_read(hash)?;
                file.seek(SeekFrom::Start(start))?;
                return Ok(Some(file));
            }
        }
        Ok(None)
    }

    /// Append handle on the active location's copy of `hash`. The file is
    /// created on the first write or at [`finalize`](Self::finalize).
    pub fn open_for_append(&self, hash: &ContentHash) -> io::Result<BlobSink> {
        let (backends, active) = self.snapshot();
        let backend = backends[active].clone();
        let existing = backend.size(hash)?;
        Ok(BlobSink {
            backend,
            hash: hash.clone(),
            existing,
            written: 0,
            file: None,
        })
    }

    pub fn stats(&self) -> io::Result<StoreStats> {
        let (backends, _) = self.snapshot();
        let mut stats = StoreStats::default();
        for backend in &backends {
            let (blobs, bytes) = backend.usage()?;
            stats.blobs += blobs;
            stats.bytes += bytes;
        }
        Ok(stats)
    }

    /// Flushes `sink` and re-hashes its blob from disk. On mismatch the blob
    /// is deleted so a retry starts from an empty file.
    pub async fn finalize(&self, mut sink: BlobSink) -> Result<u64, StoreError> {
        sink.ensure_open()?;
        sink.sync().await?;
        verify_blob(&sink.backend, &sink.hash).await
    }

    /// Appends an upload body for `hash` whose first byte sits at
    /// `client_start` in the source file.
    ///
    /// The length already on disk is authoritative: overlapping leading bytes
    /// are dropped, and a body starting beyond the stored length is refused.
    pub async fn accept_upload<S, E>(
        &self,
        hash: &ContentHash,
        client_start: u64,
        declared_size: Option<u64>,
        body: S,
    ) -> Result<UploadOutcome, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let lock = self
            .upload_locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let result = self.append_locked(hash, client_start, declared_size, body).await;

        drop(guard);
        drop(lock);
        self.upload_locks.remove_if(hash, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn append_locked<S, E>(
        &self,
        hash: &ContentHash,
        client_start: u64,
        declared_size: Option<u64>,
        body: S,
    ) -> Result<UploadOutcome, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let mut sink = self.open_for_append(hash)?;

        // A complete copy in a read-only location already satisfies the upload
        let (backends, _) = self.snapshot();
        for backend in backends.iter().filter(|b| b.root() != sink.backend.root()) {
            match (backend.size(hash)?, declared_size) {
                (Some(size), Some(total)) if size >= total => return Ok(UploadOutcome::Exists { size }),
                (Some(size), None) => return Ok(UploadOutcome::Exists { size }),
                _ => {}
            }
        }

        if let (Some(stored), Some(total)) = (sink.existing, declared_size) {
            if stored >= total {
                let size = self.finalize(sink).await?;
                return Ok(UploadOutcome::Exists { size });
            }
        }

        let stored = sink.existing.unwrap_or(0);
        if stored < client_start {
            return Err(StoreError::OffsetGap {
                stored,
                offered: client_start,
            });
        }
        let mut skip = stored - client_start;
        let mut body = std::pin::pin!(body);

        while let Some(chunk) = body.next().await {
            let mut chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    sink.sync().await?;
                    return Err(StoreError::Body {
                        stored: sink.len(),
                        message: e.to_string(),
                    });
                }
            };
            if skip > 0 {
                let len = chunk.len() as u64;
                if len <= skip {
                    skip -= len;
                    continue;
                }
                chunk = chunk.slice(skip as usize..);
                skip = 0;
            }
            sink.write(&chunk).await?;
        }
        sink.sync().await?;

        let size = sink.len();
        if let Some(total) = declared_size {
            if size < total {
                tracing::debug!(hash = %hash, size, total, "Partial upload kept for resume");
                return Ok(UploadOutcome::Incomplete { size });
            }
        }

        let appended = sink.written > 0 || sink.existing.is_none();
        let size = self.finalize(sink).await?;
        if appended {
            Ok(UploadOutcome::Stored { size })
        } else {
            Ok(UploadOutcome::Exists { size })
        }
    }
}

/// Appends to one blob in the location that was active when it was opened.
pub struct BlobSink {
    backend: Arc<dyn StorageBackend>,
    hash: ContentHash,
    /// Length on disk before this sink wrote anything
    existing: Option<u64>,
    written: u64,
    file: Option<tokio::fs::File>,
}

impl BlobSink {
    /// Bytes on disk including everything written through this sink.
    pub fn len(&self) -> u64 {
        self.existing.unwrap_or(0) + self.written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&mut self) -> io::Result<&mut tokio::fs::File> {
        if self.file.is_none() {
            let file = self.backend.open_for_append(&self.hash)?;
            self.file = Some(tokio::fs::File::from_std(file));
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("blob file not open"))
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.ensure_open()?.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn sync(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

async fn verify_blob(backend: &Arc<dyn StorageBackend>, hash: &ContentHash) -> Result<u64, StoreError> {
    let path = backend.blob_path(hash);
    let computed = tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

    if &computed != hash {
        tracing::warn!(hash = %hash, computed = %computed, "Blob failed verification, removing");
        backend.remove(hash)?;
        return Err(StoreError::Integrity { computed });
    }
    Ok(backend.size(hash)?.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_protocol::hash_bytes;
    use futures_util::stream;
    use tempfile::TempDir;

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, io::Error>> {
        stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    fn store_in(dir: &TempDir, names: &[&str]) -> ContentStore {
        let dirs: Vec<PathBuf> = names.iter().map(|n| dir.path().join(n)).collect();
        ContentStore::from_dirs(&dirs, 0).unwrap()
    }

    fn blob_bytes(store: &ContentStore, hash: &ContentHash) -> Vec<u8> {
        let mut file = store.open_range(hash, 0).unwrap().unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_upload_then_exists() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let hash = hash_bytes(b"hello world");

        let outcome = store
            .accept_upload(&hash, 0, Some(11), body(&[b"hello ", b"world"]))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { size: 11 });
        assert!(store.has(&hash));

        let again = store
            .accept_upload(&hash, 0, Some(11), body(&[b"hello world"]))
            .await
            .unwrap();
        assert_eq!(again, UploadOutcome::Exists { size: 11 });
        assert_eq!(blob_bytes(&store, &hash), b"hello world");
    }

    #[tokio::test]
    async fn test_resume_after_interrupted_stream() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let data: &'static [u8] = b"0123456789abcdefghij";
        let hash = hash_bytes(data);

        let broken = stream::iter(vec![
            Ok(Bytes::from_static(&data[..7])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);
        let err = store.accept_upload(&hash, 0, Some(20), broken).await.unwrap_err();
        assert!(matches!(err, StoreError::Body { stored: 7, .. }));
        assert_eq!(store.size(&hash).unwrap(), Some(7));

        let outcome = store
            .accept_upload(&hash, 7, Some(20), body(&[&data[7..]]))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { size: 20 });
        assert_eq!(blob_bytes(&store, &hash), data);
    }

    #[tokio::test]
    async fn test_overlapping_resume_skips_stored_prefix() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let data: &'static [u8] = b"the quick brown fox";
        let hash = hash_bytes(data);

        let partial = store
            .accept_upload(&hash, 0, Some(data.len() as u64), body(&[&data[..10]]))
            .await
            .unwrap();
        assert_eq!(partial, UploadOutcome::Incomplete { size: 10 });

        // Client restarts from byte 4 even though 10 are stored
        let outcome = store
            .accept_upload(&hash, 4, Some(data.len() as u64), body(&[&data[4..8], &data[8..]]))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { size: data.len() as u64 });
        assert_eq!(blob_bytes(&store, &hash), data);
    }

    #[tokio::test]
    async fn test_offset_past_stored_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let hash = hash_bytes(b"abcdef");

        let err = store
            .accept_upload(&hash, 3, Some(6), body(&[b"def"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OffsetGap { stored: 0, offered: 3 }));
        assert!(!store.has(&hash));
    }

    #[tokio::test]
    async fn test_mismatch_removes_blob() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let hash = hash_bytes(b"expected");

        let err = store
            .accept_upload(&hash, 0, Some(8), body(&[b"tampered"]))
            .await
            .unwrap_err();
        match err {
            StoreError::Integrity { computed } => assert_eq!(computed, hash_bytes(b"tampered")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.has(&hash));

        // A clean retry starts from zero and succeeds
        let outcome = store
            .accept_upload(&hash, 0, Some(8), body(&[b"expected"]))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { size: 8 });
    }

    #[tokio::test]
    async fn test_empty_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let hash = hash_bytes(b"");

        let outcome = store.accept_upload(&hash, 0, Some(0), body(&[])).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { size: 0 });
        assert!(store.is_complete(&hash, 0).unwrap());
    }

    #[tokio::test]
    async fn test_writes_go_to_active_location() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a", "b"]);
        store.set_active(1).unwrap();
        let hash = hash_bytes(b"payload");

        store
            .accept_upload(&hash, 0, Some(7), body(&[b"payload"]))
            .await
            .unwrap();
        assert!(dir.path().join("b").join(hash.as_str()).is_file());
        assert!(!dir.path().join("a").join(hash.as_str()).exists());

        // Switching back: the old location is now a read-only fallback
        store.set_active(0).unwrap();
        assert!(store.has(&hash));
        let outcome = store
            .accept_upload(&hash, 0, Some(7), body(&[b"payload"]))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Exists { size: 7 });
        assert!(!dir.path().join("a").join(hash.as_str()).exists());
    }

    #[tokio::test]
    async fn test_partial_copy_in_old_location_is_not_a_resume_point() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a", "b"]);
        let data: &'static [u8] = b"0123456789abcdefghij";
        let hash = hash_bytes(data);

        let partial = store
            .accept_upload(&hash, 0, Some(20), body(&[&data[..7]]))
            .await
            .unwrap();
        assert_eq!(partial, UploadOutcome::Incomplete { size: 7 });
        assert_eq!(store.resume_offset(&hash, Some(20)).unwrap(), Some(7));

        store.set_active(1).unwrap();
        assert_eq!(store.size(&hash).unwrap(), None);
        assert_eq!(store.resume_offset(&hash, Some(20)).unwrap(), None);
        assert_eq!(store.resume_offset(&hash, None).unwrap(), Some(7));

        let gap = store
            .accept_upload(&hash, 7, Some(20), body(&[&data[7..]]))
            .await
            .unwrap_err();
        assert!(matches!(gap, StoreError::OffsetGap { stored: 0, offered: 7 }));

        let outcome = store
            .accept_upload(&hash, 0, Some(20), body(&[data]))
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Stored { size: 20 });
        assert_eq!(store.resume_offset(&hash, Some(20)).unwrap(), Some(20));
        assert_eq!(std::fs::read(dir.path().join("b").join(hash.as_str())).unwrap(), data);
    }

    #[tokio::test]
    async fn test_complete_copy_in_old_location_counts() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a", "b"]);
        let hash = hash_bytes(b"payload");
        store.accept_upload(&hash, 0, Some(7), body(&[b"payload"])).await.unwrap();

        store.set_active(1).unwrap();
        assert_eq!(store.resume_offset(&hash, Some(7)).unwrap(), Some(7));
        assert!(store.is_complete(&hash, 7).unwrap());
    }

    #[tokio::test]
    async fn test_sink_then_finalize() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let hash = hash_bytes(b"hello world");

        let mut sink = store.open_for_append(&hash).unwrap();
        assert!(sink.is_empty());
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        assert_eq!(sink.len(), 11);
        assert_eq!(store.finalize(sink).await.unwrap(), 11);

        let wrong = hash_bytes(b"something else");
        let mut sink = store.open_for_append(&wrong).unwrap();
        sink.write(b"hello world").await.unwrap();
        let err = store.finalize(sink).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity { computed } if computed == hash));
        assert!(!store.has(&wrong));
    }

    #[test]
    fn test_location_management() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);

        assert_eq!(store.remove_location(0), Err(LocationError::LastLocation));
        let extra = Arc::new(DirectoryBackend::open(dir.path().join("b")).unwrap());
        assert!(store.add_location(extra.clone()));
        assert!(!store.add_location(extra));

        assert_eq!(store.set_active(5), Err(LocationError::InvalidIndex));
        store.set_active(1).unwrap();
        assert_eq!(store.remove_location(1), Err(LocationError::ActiveLocation));

        let removed = store.remove_location(0).unwrap();
        assert_eq!(removed, dir.path().join("a"));
        let (roots, active) = store.locations();
        assert_eq!(roots, vec![dir.path().join("b")]);
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn test_open_range_seeks() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a"]);
        let hash = hash_bytes(b"0123456789");
        store.accept_upload(&hash, 0, Some(10), body(&[b"0123456789"])).await.unwrap();

        let (root, size) = store.locate(&hash).unwrap().unwrap();
        assert_eq!(root, dir.path().join("a"));
        assert_eq!(size, 10);

        let mut file = store.open_range(&hash, 6).unwrap().unwrap();
        let mut rest = String::new();
        std::io::Read::read_to_string(&mut file, &mut rest).unwrap();
        assert_eq!(rest, "6789");
        assert!(store.open_range(&hash_bytes(b"nope"), 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_cover_all_locations() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["a", "b"]);
        store.accept_upload(&hash_bytes(b"one"), 0, Some(3), body(&[b"one"])).await.unwrap();
        store.set_active(1).unwrap();
        store.accept_upload(&hash_bytes(b"three"), 0, Some(5), body(&[b"three"])).await.unwrap();

        assert_eq!(store.stats().unwrap(), StoreStats { blobs: 2, bytes: 8 });
    }
}
