//! In-memory backend for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::backend::{Backend, CreateOutcome};
use crate::error::{StorageError, StorageResult};

/// Process-local blob store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object synchronously.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects().insert(key.into(), data.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects().contains_key(key)
    }

    /// Snapshot of an object's content.
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).cloned()
    }

    /// All keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.objects().insert(key.to_string(), data);
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> StorageResult<CreateOutcome> {
        let mut objects = self.objects();
        if objects.contains_key(key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        objects.insert(key.to_string(), data);
        Ok(CreateOutcome::Created)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects().remove(key);
        Ok(())
    }
}
