//! Summarizes extracted text with a generative model.

use crate::broker::{Route, Topology, publish_message};
use crate::messages::{GenAiRequest, GenAiResult};
use crate::pipeline::{StageContext, StageError, StageHandler};
use crate::summarization::SummarizationClient;
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;

/// Consumes `GenAiRequest` and publishes one `GenAiResult` to the result queue.
pub struct SummarizeStage {
    client: Arc<dyn SummarizationClient>,
    result_queue: String,
}

impl SummarizeStage {
    /// Create the stage publishing results to `result_queue`.
    pub fn new(client: Arc<dyn SummarizationClient>, result_queue: impl Into<String>) -> Self {
        Self {
            client,
            result_queue: result_queue.into(),
        }
    }
}

#[async_trait]
impl StageHandler for SummarizeStage {
    type Input = GenAiRequest;
    const NAME: &'static str = "summarize";

    fn outputs(&self) -> Vec<Topology> {
        vec![Topology::queue(&self.result_queue)]
    }

    async fn handle(&self, input: GenAiRequest, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let result = if input.text.trim().is_empty() {
            tracing::info!(document_id = input.document_id, "No text to summarize");
            GenAiResult {
                document_id: input.document_id,
                summary: String::new(),
                model: self.client.model().to_string(),
                processing_time_ms: 0,
                produced_at_utc: Some(OffsetDateTime::now_utc()),
            }
        } else {
            let summary = self.client.summarize(&input.text).await?;
            GenAiResult {
                document_id: input.document_id,
                summary: summary.summary,
                model: summary.model,
                processing_time_ms: summary.elapsed_ms,
                produced_at_utc: Some(OffsetDateTime::now_utc()),
            }
        };

        publish_message(ctx.publisher, &Route::queue(&self.result_queue), &result).await?;
        tracing::info!(
            document_id = result.document_id,
            model = %result.model,
            processing_time_ms = result.processing_time_ms,
            "Summary published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::messages::decode;
    use crate::summarization::{Summary, SummarizationClientError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct CannedClient {
        calls: AtomicUsize,
        fail_with: Option<fn() -> SummarizationClientError>,
    }

    #[async_trait]
    impl SummarizationClient for CannedClient {
        fn model(&self) -> &str {
            "canned"
        }

        async fn summarize(&self, text: &str) -> Result<Summary, SummarizationClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            Ok(Summary {
                summary: format!("- {}", text.to_uppercase()),
                model: "canned".into(),
                elapsed_ms: 42,
            })
        }
    }

    fn request(text: &str) -> GenAiRequest {
        GenAiRequest {
            document_id: 5,
            text: text.into(),
            title: "Letter".into(),
            produced_at_utc: None,
        }
    }

    async fn run(stage: &SummarizeStage, broker: &MemoryBroker, text: &str) -> Result<(), StageError> {
        let cancel = CancellationToken::new();
        let ctx = StageContext {
            publisher: broker,
            cancel: &cancel,
            delivery_tag: 1,
            redelivered: false,
        };
        stage.handle(request(text), &ctx).await
    }

    #[tokio::test]
    async fn publishes_the_generated_summary() {
        let client = Arc::new(CannedClient::default());
        let stage = SummarizeStage::new(client.clone(), "genai-result");
        let broker = MemoryBroker::new();

        run(&stage, &broker, "pay by friday").await.expect("handled");

        let published = broker.published_to("genai-result").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, "genai-result.v1");
        let result: GenAiResult = decode(&published[0].body).expect("decode");
        assert_eq!(result.document_id, 5);
        assert_eq!(result.summary, "- PAY BY FRIDAY");
        assert_eq!(result.model, "canned");
        assert_eq!(result.processing_time_ms, 42);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_text_skips_the_provider() {
        let client = Arc::new(CannedClient::default());
        let stage = SummarizeStage::new(client.clone(), "genai-result");
        let broker = MemoryBroker::new();

        run(&stage, &broker, "  \n ").await.expect("handled");

        let published = broker.published_to("genai-result").await;
        let result: GenAiResult = decode(&published[0].body).expect("decode");
        assert_eq!(result.summary, "");
        assert_eq!(result.model, "canned");
        assert_eq!(result.processing_time_ms, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_outage_is_transient_and_publishes_nothing() {
        let client = Arc::new(CannedClient {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| SummarizationClientError::ProviderUnavailable("timeout".into())),
        });
        let stage = SummarizeStage::new(client, "genai-result");
        let broker = MemoryBroker::new();

        let error = run(&stage, &broker, "text").await.expect_err("outage");
        assert!(error.is_transient());
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_provider_reply_is_permanent() {
        let client = Arc::new(CannedClient {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| SummarizationClientError::InvalidResponse("no candidates".into())),
        });
        let stage = SummarizeStage::new(client, "genai-result");
        let broker = MemoryBroker::new();

        let error = run(&stage, &broker, "text").await.expect_err("bad reply");
        assert!(!error.is_transient());
    }

    #[test]
    fn declares_the_result_queue() {
        let stage = SummarizeStage::new(Arc::new(CannedClient::default()), "genai-result");
        assert_eq!(stage.outputs(), vec![Topology::queue("genai-result")]);
    }
}
