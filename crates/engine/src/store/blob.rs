// Content-addressed blob storage.
//
// Blobs live at `{dir}/{hash}` where `hash` is the first seven hex digits of
// the SHA-256 of the content. A blob is written once and never rewritten.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex prefix identifying a stored blob.
pub type ContentHash = String;

const HASH_LEN: usize = 7;

/// Lowercase hex SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn content_hash(content: &str) -> ContentHash {
    let mut hex = sha256_hex(content.as_bytes());
    hex.truncate(HASH_LEN);
    hex
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    /// Stores `content` unless a blob with its hash already exists.
    pub async fn put(&self, content: &str) -> Result<ContentHash> {
        let hash = content_hash(content);
        let path = self.blob_path(&hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(hash);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create blob directory `{}`", self.dir.display()))?;
        write_atomic(&path, content.as_bytes()).await?;
        Ok(hash)
    }

    pub async fn get(&self, hash: &str) -> Result<String> {
        let path = self.blob_path(hash);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read blob `{}`", path.display()))
    }
}

/// Writes `bytes` to a sibling temp file, then renames it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("blob");
    let tmp_path = path.with_file_name(format!("{file_name}.tmp.{}", Uuid::new_v4().simple()));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .with_context(|| format!("failed to write temp file `{}`", tmp_path.display()))?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err).with_context(|| {
            format!("failed to atomically move `{}` to `{}`", tmp_path.display(), path.display())
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sha256_hex_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_hash_is_seven_hex_chars() {
        assert_eq!(content_hash(""), "e3b0c44");
        assert_eq!(content_hash("hello"), "2cf24db");
    }

    #[tokio::test]
    async fn put_is_idempotent_and_readable() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::new(tmp.path().join("contents"));

        let first = store.put("fn main() {}\n").await.unwrap();
        let second = store.put("fn main() {}\n").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get(&first).await.unwrap(), "fn main() {}\n");

        let files = std::fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn missing_blob_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::new(tmp.path());
        assert!(store.get("0000000").await.is_err());
    }
}
