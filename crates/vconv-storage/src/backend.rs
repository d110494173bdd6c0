//! Blob store capability shared by all backends.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Media container suffixes picked up by [`Backend::list`].
pub const MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mov", ".mkv"];

/// Check if a key names a recognized media file (case-insensitive).
pub fn is_media_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    MEDIA_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Outcome of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object did not exist and was written
    Created,
    /// The object already existed; nothing was written
    AlreadyExists,
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created)
    }
}

/// Keyed blob store.
///
/// Every operation is durable once it returns `Ok`. Implementations do
/// not cache across calls. `create_if_absent` must be atomic: two racing
/// callers can never both observe [`CreateOutcome::Created`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// List every key under `prefix`, in no particular order.
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Read an object. Missing keys yield [`StorageError::NotFound`].
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Write an object, replacing any previous content.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Write an object only if the key does not exist yet.
    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> StorageResult<CreateOutcome>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List media files under `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let keys = self.list_keys(prefix).await?;
        Ok(keys.into_iter().filter(|k| is_media_key(k)).collect())
    }

    /// Read an object, mapping a missing key to `None`.
    async fn get_optional(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.get(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Download an object into a local file.
    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()> {
        debug!(backend = self.name(), key, path = %path.display(), "Downloading");
        let bytes = self.get(key).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::download_failed(format!("Failed to create directory: {}", e))
            })?;
        }

        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Upload a local file under `key`.
    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()> {
        debug!(backend = self.name(), key, path = %path.display(), "Uploading");
        let bytes = tokio::fs::read(path).await?;
        self.put(key, bytes).await
    }
}
