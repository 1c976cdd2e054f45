//! Storage locations holding content blobs.

use backup_protocol::ContentHash;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// One place blobs can live. Blobs are addressed purely by content hash.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn root(&self) -> &Path;

    fn has(&self, hash: &ContentHash) -> bool;

    /// Current on-disk length, `None` if the blob does not exist here.
    fn size(&self, hash: &ContentHash) -> io::Result<Option<u64>>;

    /// Opens the blob for appending, creating it if needed.
    fn open_for_append(&self, hash: &ContentHash) -> io::Result<File>;

    fn open_read(&self, hash: &ContentHash) -> io::Result<File>;

    fn remove(&self, hash: &ContentHash) -> io::Result<()>;

    /// Blob count and total bytes.
    fn usage(&self) -> io::Result<(u64, u64)>;

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root().join(hash.as_str())
    }
}

/// Flat directory of blobs, each file named by its hex hash.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl StorageBackend for DirectoryBackend {
    fn root(&self) -> &Path {
        &self.root
    }

    fn has(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    fn size(&self, hash: &ContentHash) -> io::Result<Option<u64>> {
        match std::fs::metadata(self.blob_path(hash)) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_for_append(&self, hash: &ContentHash) -> io::Result<File> {
        std::fs::create_dir_all(&self.root)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.blob_path(hash))
    }

    fn open_read(&self, hash: &ContentHash) -> io::Result<File> {
        File::open(self.blob_path(hash))
    }

    fn remove(&self, hash: &ContentHash) -> io::Result<()> {
        match std::fs::remove_file(self.blob_path(hash)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn usage(&self) -> io::Result<(u64, u64)> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    count += 1;
                    bytes += meta.len();
                }
            }
        }
        Ok((count, bytes))
    }
}
