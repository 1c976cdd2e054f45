//! Local file system side of a backup run.

pub mod exclude;
pub mod hasher;
pub mod walker;

pub use exclude::ExcludeSet;
pub use walker::{scan_tree, Candidate, ScanError, ScanOutcome};
