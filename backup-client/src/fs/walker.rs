//! Directory traversal producing backup candidates.

use super::exclude::ExcludeSet;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::{DirEntry, WalkDir};

/// A regular file found under the backup root.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Full path to the file
    pub full_path: PathBuf,

    /// Forward-slash path relative to the root
    pub relative_path: String,

    pub size: u64,

    /// Modification time, milliseconds since the Unix epoch
    pub mtime_ms: i64,
}

/// A file or directory that could not be read during the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanError {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub candidates: Vec<Candidate>,
    pub errors: Vec<ScanError>,
    /// Files dropped by an exclusion pattern
    pub skipped: u64,
    /// Directories pruned by an exclusion pattern
    pub pruned_dirs: u64,
}

impl ScanOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size).sum()
    }
}

fn relative(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Builds a candidate from a walk entry. Symlinks are resolved to their
/// target; links to directories and broken links yield `None`.
fn candidate(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Candidate>> {
    let path = entry.path();
    let metadata = if entry.path_is_symlink() {
        match std::fs::metadata(path) {
            Ok(resolved) if resolved.is_file() => resolved,
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::debug!("Skipping broken symlink {}: {}", path.display(), e);
                return Ok(None);
            }
        }
    } else {
        entry.metadata().map_err(std::io::Error::from)?
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    // Readability check; the content is hashed later
    std::fs::File::open(path)?;

    Ok(Some(Candidate {
        full_path: path.to_path_buf(),
        relative_path: relative(path, root),
        size: metadata.len(),
        mtime_ms: mtime_ms(&metadata),
    }))
}

/// Walks `root`, applying `excludes` to every entry.
///
/// Excluded directories are not descended into. Unreadable entries are
/// recorded in [`ScanOutcome::errors`] and the walk carries on. `on_file` is
/// called once per accepted candidate.
pub fn scan_tree<F>(root: &Path, excludes: &ExcludeSet, mut on_file: F) -> ScanOutcome
where
    F: FnMut(&Candidate),
{
    let mut outcome = ScanOutcome::default();
    let mut pruned_dirs = 0u64;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let keep = !excludes.is_excluded(&relative(entry.path(), root));
            if !keep {
                pruned_dirs += 1;
            }
            keep
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| relative(p, root)).unwrap_or_default();
                tracing::warn!("Directory walk error at {}: {}", path, e);
                outcome.errors.push(ScanError {
                    path,
                    error: e.to_string(),
                });
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let rel = relative(entry.path(), root);
        if excludes.is_excluded(&rel) {
            tracing::debug!("Excluded: {}", rel);
            outcome.skipped += 1;
            continue;
        }

        match candidate(&entry, root) {
            Ok(Some(found)) => {
                on_file(&found);
                outcome.candidates.push(found);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Cannot access file {}: {}", rel, e);
                outcome.errors.push(ScanError {
                    path: rel,
                    error: e.to_string(),
                });
            }
        }
    }

    outcome.pruned_dirs = pruned_dirs;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(outcome: &ScanOutcome) -> Vec<&str> {
        outcome.candidates.iter().map(|c| c.relative_path.as_str()).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = scan_tree(temp_dir.path(), &ExcludeSet::default(), |_| {});
        assert!(outcome.candidates.is_empty());
        assert!(outcome.errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("sub/deeper"))?;
        fs::write(temp_dir.path().join("a.txt"), b"hello")?;
        fs::write(temp_dir.path().join("sub/deeper/b.txt"), b"world!")?;

        let mut seen = 0;
        let outcome = scan_tree(temp_dir.path(), &ExcludeSet::default(), |_| seen += 1);
        assert_eq!(names(&outcome), vec!["a.txt", "sub/deeper/b.txt"]);
        assert_eq!(seen, 2);
        assert_eq!(outcome.total_bytes(), 11);
        assert!(outcome.candidates[0].mtime_ms > 0);
        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("web/node_modules/react"))?;
        fs::write(temp_dir.path().join("web/node_modules/react/index.js"), b"x")?;
        fs::write(temp_dir.path().join("web/app.js"), b"y")?;
        fs::write(temp_dir.path().join("web/cache.tmp"), b"z")?;

        let excludes = ExcludeSet::new(&["**/node_modules/**", "**/*.tmp"]).unwrap();
        let outcome = scan_tree(temp_dir.path(), &excludes, |_| {});
        assert_eq!(names(&outcome), vec!["web/app.js"]);
        assert_eq!(outcome.pruned_dirs, 1);
        assert_eq!(outcome.skipped, 1);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_resolve_to_files_only() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("real.txt"), b"data")?;
        fs::create_dir(temp_dir.path().join("dir"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("real.txt"), temp_dir.path().join("link.txt"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("dir"), temp_dir.path().join("dirlink"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("gone"), temp_dir.path().join("broken"))?;

        let outcome = scan_tree(temp_dir.path(), &ExcludeSet::default(), |_| {});
        assert_eq!(names(&outcome), vec!["link.txt", "real.txt"]);
        assert_eq!(outcome.candidates[0].size, 4);
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = scan_tree(&temp_dir.path().join("nope"), &ExcludeSet::default(), |_| {});
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }
}
