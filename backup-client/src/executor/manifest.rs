//! The file list a run negotiates with the receiver.

use crate::fs::Candidate;
use backup_protocol::wire::ManifestEntry;
use backup_protocol::ContentHash;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A scanned file with its content hash.
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub full_path: PathBuf,
    pub relpath: String,
    pub size: u64,
    pub mtime: i64,
    pub sha: ContentHash,
}

impl HashedFile {
    pub fn new(candidate: Candidate, sha: ContentHash) -> Self {
        Self {
            full_path: candidate.full_path,
            relpath: candidate.relative_path,
            size: candidate.size,
            mtime: candidate.mtime_ms,
            sha,
        }
    }

    pub fn entry(&self) -> ManifestEntry {
        ManifestEntry {
            relpath: self.relpath.clone(),
            size: self.size,
            mtime: self.mtime,
            sha: self.sha.clone(),
        }
    }
}

/// Wire entries for every file whose hash is not in `failed`.
pub fn entries(files: &[HashedFile], failed: &HashSet<ContentHash>) -> Vec<ManifestEntry> {
    files
        .iter()
        .filter(|f| !failed.contains(&f.sha))
        .map(HashedFile::entry)
        .collect()
}

/// First file carrying each hash. Identical content under several paths is
/// uploaded once.
pub fn by_hash(files: &[HashedFile]) -> HashMap<ContentHash, &HashedFile> {
    let mut index = HashMap::with_capacity(files.len());
    for file in files {
        index.entry(file.sha.clone()).or_insert(file);
    }
    index
}
