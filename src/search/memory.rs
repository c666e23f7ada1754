//! In-process search index for tests and local runs.

use super::{SearchIndex, SearchIndexError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A stored search document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    /// Document title.
    pub title: String,
    /// Indexed text.
    pub content: String,
}

/// Search index backed by a shared ordered map. Clones observe the same documents.
#[derive(Clone, Default)]
pub struct MemorySearchIndex {
    documents: Arc<Mutex<BTreeMap<i64, IndexedDocument>>>,
    writes: Arc<Mutex<u64>>,
}

impl MemorySearchIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current documents ordered by id.
    pub async fn documents(&self) -> BTreeMap<i64, IndexedDocument> {
        self.documents.lock().await.clone()
    }

    /// Number of upserts applied, including overwrites.
    pub async fn write_count(&self) -> u64 {
        *self.writes.lock().await
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_index(&self) -> Result<(), SearchIndexError> {
        Ok(())
    }

    async fn upsert_document(
        &self,
        document_id: i64,
        title: &str,
        text: &str,
    ) -> Result<(), SearchIndexError> {
        self.documents.lock().await.insert(
            document_id,
            IndexedDocument {
                title: title.to_string(),
                content: text.to_string(),
            },
        );
        *self.writes.lock().await += 1;
        Ok(())
    }
}
