use backup_protocol::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const MANIFEST_FILE: &str = "manifest.json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub date: String,
    pub day_index: u32,
    pub version_id: String,
    pub created_at: String,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub sha: ContentHash,
    pub size: u64,
    pub mtime: i64,
}

/// The authoritative file map of one committed version, stored as
/// `<version dir>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub metadata: ManifestMetadata,
    pub files: BTreeMap<String, FileEntry>,
}

impl VersionManifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

pub fn manifest_path(version_dir: &Path) -> PathBuf {
    version_dir.join(MANIFEST_FILE)
}

/// Writes to a temp file unique to this call in the same directory, then
/// renames over the target.
pub async fn write(version_dir: &Path, manifest: &VersionManifest) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(version_dir).await?;
    let json = serde_json::to_vec_pretty(manifest)?;
    let target = manifest_path(version_dir);
    let tmp = version_dir.join(format!(
        ".{}.{}-{}.tmp",
        MANIFEST_FILE,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Removes a version's manifest if present.
pub async fn remove(version_dir: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(manifest_path(version_dir)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn read(version_dir: &Path) -> anyhow::Result<Option<VersionManifest>> {
    let bytes = match tokio::fs::read(manifest_path(version_dir)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_protocol::hash_bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("date-[2024-05-01] (day 1)").join("version-x");

        let mut files = BTreeMap::new();
        files.insert(
            "docs/a.txt".to_string(),
            FileEntry {
                sha: hash_bytes(b"hello"),
                size: 5,
                mtime: 1_700_000_000_000,
            },
        );
        let manifest = VersionManifest {
            metadata: ManifestMetadata {
                date: "2024-05-01".into(),
                day_index: 1,
                version_id: "version-x".into(),
                created_at: "2024-05-01T00:00:00.000Z".into(),
                extra: serde_json::Map::new(),
            },
            files,
        };

        assert!(read(&version_dir).await.unwrap().is_none());
        write(&version_dir, &manifest).await.unwrap();
        assert_eq!(read(&version_dir).await.unwrap(), Some(manifest.clone()));
        assert_eq!(manifest.total_bytes(), 5);
        let leftovers: Vec<_> = std::fs::read_dir(&version_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(manifest_path(&version_dir)).unwrap()).unwrap();
        assert_eq!(raw["metadata"]["dayIndex"], 1);
        assert_eq!(raw["files"]["docs/a.txt"]["size"], 5);
    }
}
