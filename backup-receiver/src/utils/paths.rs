use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Resolves a version path as stored in metadata (`backups/<day>/<version>`)
/// against the data root. Absolute paths and anything that could climb out of
/// `backups/` are refused.
pub fn resolve_version_path(data_root: &Path, version_path: &str) -> Option<PathBuf> {
    let rel = Path::new(version_path);
    let mut components = rel.components();
    if components.next() != Some(Component::Normal(OsStr::new("backups"))) {
        return None;
    }
    let mut depth = 0;
    for component in components {
        match component {
            Component::Normal(_) => depth += 1,
            _ => return None,
        }
    }
    if depth == 0 {
        return None;
    }
    Some(data_root.join(rel))
}

/// A day folder name as used in URLs; must be one plain path segment.
pub fn is_plain_segment(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
