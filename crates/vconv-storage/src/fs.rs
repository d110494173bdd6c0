//! Local filesystem backend.
//!
//! Keys map to files below a root directory. Every write goes through a
//! temp file first, so readers never observe a half-written document.
//! Overwrites publish it with a rename; conditional creates publish it
//! with a hard link, which fails atomically when the key exists.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, CreateOutcome};
use crate::error::{StorageError, StorageResult};

/// Marker in temp file names; such files are never listed.
const TEMP_MARKER: &str = ".vconv-tmp-";

/// Backend storing objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, rejecting keys that escape the root.
    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::invalid_key(key));
        }

        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StorageError::invalid_key(key));
        }

        Ok(self.root.join(relative))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{}{}{}", name, TEMP_MARKER, Uuid::new_v4().simple()))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write `data` next to `path`, then rename it into place.
    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        Self::ensure_parent(path).await?;
        let tmp = Self::temp_path(path);

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::upload_failed(format!(
                "{}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::ListFailed(e.to_string())),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::ListFailed(e.to_string()))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) && !key.contains(TEMP_MARKER) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(StorageError::download_failed(format!("{}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        debug!("Writing {} bytes to {}", data.len(), path.display());
        Self::write_atomic(&path, &data).await
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> StorageResult<CreateOutcome> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        let tmp = Self::temp_path(&path);

        // The body is complete before the key becomes visible; `hard_link`
        // refuses to replace an existing file.
        let published = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::hard_link(&tmp, &path).await
        }
        .await;

        if let Err(e) = fs::remove_file(&tmp).await {
            if e.kind() != ErrorKind::NotFound {
                debug!("Failed to remove {}: {}", tmp.display(), e);
            }
        }

        match published {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(StorageError::upload_failed(format!("{}: {}", key, e))),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(format!("{}: {}", key, e))),
        }
    }

    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()> {
        let source = self.path_for(key)?;
        Self::ensure_parent(path).await?;
        match fs::copy(&source, path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(StorageError::download_failed(format!("{}: {}", key, e))),
        }
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()> {
        let target = self.path_for(key)?;
        Self::ensure_parent(&target).await?;
        let tmp = Self::temp_path(&target);

        if let Err(e) = fs::copy(path, &tmp).await {
            return Err(StorageError::upload_failed(format!("{}: {}", path.display(), e)));
        }
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::upload_failed(format!("{}: {}", key, e)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());

        backend.put("meta/stats.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(backend.get("meta/stats.json").await.unwrap(), b"{}");

        backend.delete("meta/stats.json").await.unwrap();
        assert!(backend.get("meta/stats.json").await.unwrap_err().is_not_found());

        // Deleting again is fine
        backend.delete("meta/stats.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());

        let first = backend.create_if_absent("meta/update.lock", b"a".to_vec()).await.unwrap();
        let second = backend.create_if_absent("meta/update.lock", b"b".to_vec()).await.unwrap();

        assert_eq!(first, CreateOutcome::Created);
        assert_eq!(second, CreateOutcome::AlreadyExists);
        assert_eq!(backend.get("meta/update.lock").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_create_if_absent_publishes_whole_body() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());
        let body = vec![b'x'; 64 * 1024];

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                backend.create_if_absent("meta/update.lock", body).await.unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_created() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(backend.get("meta/update.lock").await.unwrap(), body);
        let names: Vec<_> = std::fs::read_dir(dir.path().join("meta"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["update.lock"]);
    }

    #[tokio::test]
    async fn test_list_filters_media_and_prefix() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());

        for key in ["in/a.mp4", "in/sub/b.MKV", "in/notes.txt", "other/c.mp4"] {
            backend.put(key, b"x".to_vec()).await.unwrap();
        }

        let mut items = backend.list("in/").await.unwrap();
        items.sort();
        assert_eq!(items, ["in/a.mp4", "in/sub/b.MKV"]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path());

        assert!(matches!(
            backend.get("../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            backend.put("/abs", vec![]).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_file_transfer_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::new(dir.path().join("store"));
        let local = dir.path().join("local.mp4");
        tokio::fs::write(&local, b"video-bytes").await.unwrap();

        backend.upload_file(&local, "out/2024-01-01/a_1.mp4").await.unwrap();
        let fetched = dir.path().join("scratch/fetched.mp4");
        backend.download_file("out/2024-01-01/a_1.mp4", &fetched).await.unwrap();

        assert_eq!(tokio::fs::read(&fetched).await.unwrap(), b"video-bytes");
        assert!(backend
            .download_file("out/missing.mp4", &fetched)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
