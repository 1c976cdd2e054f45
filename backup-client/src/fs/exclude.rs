//! Exclusion patterns.
//!
//! Patterns are matched against the forward-slash path relative to the
//! backup root:
//!
//! - `**` as a whole segment matches zero or more segments
//! - `*` matches any run of characters inside one segment, never a `/`
//! - `?` matches exactly one character inside a segment
//!
//! A pattern with no `/` at all is a basename rule and matches a path when
//! any one of its segments matches, so `*.log` excludes `a/b/c.log` and
//! `node_modules` excludes everything below such a directory. A pattern
//! ending in `/**` also matches the directory itself, which lets the walker
//! prune it.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Forward-slash segments of `raw` with empty ones and repeated `**` dropped.
fn normalize(raw: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = Vec::new();
    for part in raw.trim().split('/').filter(|p| !p.is_empty()) {
        if part == "**" && segments.last() == Some(&"**") {
            continue;
        }
        segments.push(part);
    }
    segments
}

/// The globs one configured pattern expands to.
fn expand(raw: &str) -> Vec<String> {
    let segments = normalize(raw);
    match segments.as_slice() {
        [] => Vec::new(),
        [name] if *name != "**" => vec![format!("**/{}", name), format!("**/{}/**", name)],
        [dir @ .., "**"] if !dir.is_empty() => vec![segments.join("/"), dir.join("/")],
        _ => vec![segments.join("/")],
    }
}

/// A compiled set of exclusion patterns.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    globs: GlobSet,
}

impl Default for ExcludeSet {
    fn default() -> Self {
        Self {
            globs: GlobSet::empty(),
        }
    }
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            for glob in expand(pattern.as_ref()) {
                builder.add(GlobBuilder::new(&glob).literal_separator(true).build()?);
            }
        }
        Ok(Self {
            globs: builder.build()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    /// True when any pattern matches `relpath` (forward slashes, no leading `/`).
    pub fn is_excluded(&self, relpath: &str) -> bool {
        let segments: Vec<&str> = relpath.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return false;
        }
        self.globs.is_match(segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> ExcludeSet {
        ExcludeSet::new(patterns).unwrap()
    }

    #[test]
    fn test_double_star_directory() {
        let s = set(&["**/node_modules/**"]);
        assert!(s.is_excluded("node_modules/react/index.js"));
        assert!(s.is_excluded("app/web/node_modules/x.js"));
        assert!(s.is_excluded("app/node_modules"));
        assert!(!s.is_excluded("app/node_modules_backup/x.js"));
        assert!(!s.is_excluded("app/my-node_modules/x.js"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let s = set(&["src/*.rs"]);
        assert!(s.is_excluded("src/main.rs"));
        assert!(!s.is_excluded("src/bin/main.rs"));
        assert!(!s.is_excluded("other/src/main.rs"));
    }

    #[test]
    fn test_extension_anywhere() {
        let s = set(&["**/*.tmp"]);
        assert!(s.is_excluded("a.tmp"));
        assert!(s.is_excluded("deep/dir/b.tmp"));
        assert!(!s.is_excluded("deep/dir/b.tmpl"));
    }

    #[test]
    fn test_basename_rule() {
        let s = set(&["*.log", "Thumbs.db"]);
        assert!(s.is_excluded("var/app.log"));
        assert!(s.is_excluded("pics/Thumbs.db"));
        assert!(s.is_excluded("logs.log/inner.txt"));
        assert!(!s.is_excluded("var/app.log.gz"));
    }

    #[test]
    fn test_question_mark() {
        let s = set(&["**/v?.bin"]);
        assert!(s.is_excluded("v1.bin"));
        assert!(!s.is_excluded("v10.bin"));
    }

    #[test]
    fn test_multiple_stars_in_segment() {
        let s = set(&["*a*b"]);
        assert!(s.is_excluded("dir/xxaxxab"));
        assert!(!s.is_excluded("dir/xxaxxa"));
        assert!(set(&["**"]).is_excluded("any/thing"));
    }

    #[test]
    fn test_leading_slash_and_repeated_double_star() {
        let s = set(&["/build/**/**"]);
        assert!(s.is_excluded("build"));
        assert!(s.is_excluded("build/out/app"));
        assert!(!s.is_excluded("src/build/app"));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        assert!(ExcludeSet::new(&["src/[a-"]).is_err());
    }

    #[test]
    fn test_blank_patterns_ignored() {
        let s = set(&["", "  ", "/"]);
        assert!(s.is_empty());
        assert!(!s.is_excluded("anything"));
    }

    #[test]
    fn test_default_exclusions() {
        let s = ExcludeSet::new(&crate::config::BackupConfig::default().exclusions).unwrap();
        assert!(s.is_excluded("project/.git/HEAD"));
        assert!(s.is_excluded("tmp/scratch.txt"));
        assert!(s.is_excluded("photos/.DS_Store"));
        assert!(!s.is_excluded("docs/report.pdf"));
        assert!(!s.is_excluded("template/readme.md"));
    }
}
