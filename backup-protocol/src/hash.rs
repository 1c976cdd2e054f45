//! Content hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 digest of a file's full content.
///
/// Always exactly 64 characters of `[0-9a-f]`, which also makes it safe to use
/// directly as a file name inside a storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid content hash: {0:?}")]
pub struct InvalidHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest))
    }
}

impl FromStr for ContentHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidHash(s.to_string()))
        }
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_digest(Sha256::digest(data))
}

/// Hash everything a reader yields, streaming through a fixed buffer.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash::from_digest(hasher.finalize()))
}

/// Hash a file on disk in a single streaming pass.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let file = std::fs::File::open(path)?;
    hash_reader(std::io::BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_hash_bytes_known_digest() {
        assert_eq!(hash_bytes(b"hello").as_str(), HELLO);
    }

    #[test]
    fn test_hash_file_matches_bytes() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data)?;

        assert_eq!(hash_file(&path)?, hash_bytes(&data));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(HELLO.parse::<ContentHash>().is_ok());
        assert!(HELLO.to_uppercase().parse::<ContentHash>().is_err());
        assert!("../../etc/passwd".parse::<ContentHash>().is_err());
        assert!(HELLO[..63].parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_serde_validates() {
        let ok: ContentHash = serde_json::from_str(&format!("\"{}\"", HELLO)).unwrap();
        assert_eq!(ok.as_str(), HELLO);
        assert!(serde_json::from_str::<ContentHash>("\"nope\"").is_err());
    }
}
