//! In-process object store for tests and local runs.

use super::{ObjectStore, StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Object store backed by a shared map. Clones observe the same objects.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>,
}

impl MemoryObjectStore {
    /// Create an empty store for `bucket`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::default(),
        }
    }

    /// Content type recorded for `key`, if the object exists.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(_, content_type)| content_type.clone())
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (content, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().await.contains_key(key))
    }
}
