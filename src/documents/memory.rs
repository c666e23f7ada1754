//! In-process document store for tests and local runs.

use super::{DocumentStore, DocumentStoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Summaries keyed by document id. Unknown ids are rejected like a missing record.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    summaries: Arc<Mutex<HashMap<i64, Option<String>>>>,
}

impl MemoryDocumentStore {
    /// Create a store that knows the given document ids.
    pub fn with_documents(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            summaries: Arc::new(Mutex::new(ids.into_iter().map(|id| (id, None)).collect())),
        }
    }

    /// Stored summary of `document_id`, if any.
    pub async fn summary(&self, document_id: i64) -> Option<String> {
        self.summaries.lock().await.get(&document_id).cloned().flatten()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn update_summary(
        &self,
        document_id: i64,
        summary: &str,
    ) -> Result<(), DocumentStoreError> {
        match self.summaries.lock().await.get_mut(&document_id) {
            Some(slot) => {
                *slot = Some(summary.to_string());
                Ok(())
            }
            None => Err(DocumentStoreError::NotFound(document_id)),
        }
    }
}
