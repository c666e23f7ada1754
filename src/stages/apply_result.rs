//! Writes generated summaries back to the document metadata store.

use crate::documents::DocumentStore;
use crate::messages::GenAiResult;
use crate::pipeline::{StageContext, StageError, StageHandler};
use async_trait::async_trait;
use std::sync::Arc;

/// Consumes `GenAiResult` and overwrites the document's summary.
///
/// The write is a plain overwrite, so redelivery converges on the same stored value.
pub struct ApplyResultStage {
    documents: Arc<dyn DocumentStore>,
}

impl ApplyResultStage {
    /// Create the stage around a metadata store.
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl StageHandler for ApplyResultStage {
    type Input = GenAiResult;
    const NAME: &'static str = "apply-result";

    async fn handle(&self, input: GenAiResult, _ctx: &StageContext<'_>) -> Result<(), StageError> {
        self.documents
            .update_summary(input.document_id, &input.summary)
            .await?;
        tracing::info!(
            document_id = input.document_id,
            model = %input.model,
            processing_time_ms = input.processing_time_ms,
            "Summary applied"
        );
        Ok(())
    }
}
