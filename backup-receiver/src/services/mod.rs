pub mod backup_session;
pub mod catalog;
pub mod metadata;
pub mod version_manifest;
