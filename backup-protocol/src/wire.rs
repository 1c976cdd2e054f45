//! JSON bodies exchanged over HTTP between the client and the receiver.

use crate::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Byte offset the client claims its upload body starts at.
pub const HEADER_START_BYTE: &str = "x-start-byte";
/// Full size of the file whose bytes are being uploaded.
pub const HEADER_FILE_SIZE: &str = "x-filesize";

/// One file of a backup run as described by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Forward-slash separated, relative to the backup root
    pub relpath: String,
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch
    pub mtime: i64,
    pub sha: ContentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitBackupRequest {
    /// Calendar date `YYYY-MM-DD`
    pub date: String,
    pub client_id: String,
    pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitBackupResponse {
    pub day_index: u32,
    pub version_id: String,
    pub version_path: String,
    pub missing_hashes: Vec<ContentHash>,
    pub session_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffsetResponse {
    pub exists: bool,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Bytes were written and the blob verified against its hash
    Ok,
    /// A complete blob was already present; nothing was written
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub session_key: String,
    pub manifest: Vec<ManifestEntry>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub status: String,
    pub version_id: String,
    pub version_path: String,
}

/// `GET /status/has-hashes` answer: hash → present in any storage location.
pub type HasHashesResponse = BTreeMap<String, bool>;

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    /// Hashes a rejected commit still needs uploaded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_hashes: Vec<ContentHash>,
    /// Digest the receiver computed when verification failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<String>,
    /// Receiver-side blob length when the client's offset was ahead of it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}
