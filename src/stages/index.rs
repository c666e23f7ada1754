//! Writes extracted text into the search index.

use crate::messages::SearchIndexMessage;
use crate::pipeline::{StageContext, StageError, StageHandler};
use crate::search::SearchIndex;
use async_trait::async_trait;
use std::sync::Arc;

/// Consumes `SearchIndexMessage` and upserts the search document keyed by document id.
pub struct IndexStage {
    index: Arc<dyn SearchIndex>,
}

impl IndexStage {
    /// Create the stage around a search sink.
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl StageHandler for IndexStage {
    type Input = SearchIndexMessage;
    const NAME: &'static str = "index";

    async fn handle(
        &self,
        input: SearchIndexMessage,
        _ctx: &StageContext<'_>,
    ) -> Result<(), StageError> {
        self.index
            .upsert_document(input.document_id, &input.title, &input.text)
            .await?;
        tracing::info!(document_id = input.document_id, chars = input.text.len(), "Document indexed");
        Ok(())
    }
}
