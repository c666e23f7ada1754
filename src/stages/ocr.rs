//! Extracts text from uploaded PDFs and fans it out to summarization and indexing.

use crate::broker::{Route, Topology, publish_message};
use crate::messages::{GenAiRequest, OcrRequest, SearchIndexMessage};
use crate::ocr::{OcrEngine, OcrError, PageRasterizer};
use crate::pipeline::{StageContext, StageError, StageHandler};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;

const SOURCE_FILE: &str = "source.pdf";
const PAGE_FILE: &str = "page.png";

/// Queues the OCR stage publishes to.
#[derive(Debug, Clone)]
pub struct OcrOutputs {
    /// Queue consumed by the summarize stage.
    pub genai_queue: String,
    /// Queue consumed by the index stage.
    pub search_queue: String,
}

/// Consumes `OcrRequest`, downloads the PDF, recognises page one, and publishes a
/// `GenAiRequest` followed by a `SearchIndexMessage`.
///
/// Both publishes must succeed for the delivery to be acknowledged. On retry the first target
/// may receive a duplicate, which downstream stages tolerate.
pub struct OcrStage {
    store: Arc<dyn ObjectStore>,
    rasterizer: Arc<dyn PageRasterizer>,
    engine: Arc<dyn OcrEngine>,
    language: String,
    outputs: OcrOutputs,
    scratch_root: Option<PathBuf>,
}

impl OcrStage {
    /// Create the stage from its collaborators.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        rasterizer: Arc<dyn PageRasterizer>,
        engine: Arc<dyn OcrEngine>,
        language: impl Into<String>,
        outputs: OcrOutputs,
    ) -> Self {
        Self {
            store,
            rasterizer,
            engine,
            language: language.into(),
            outputs,
            scratch_root: None,
        }
    }

    /// Create per-message scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    fn scratch_dir(&self) -> Result<TempDir, OcrError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dms-ocr-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn extract(&self, input: &OcrRequest, scratch: &Path) -> Result<String, StageError> {
        let pdf = scratch.join(SOURCE_FILE);
        let png = scratch.join(PAGE_FILE);

        let bytes = self.store.download_to(&input.file_path, &pdf).await?;
        tracing::debug!(document_id = input.document_id, key = %input.file_path, bytes, "Object downloaded");

        self.rasterizer.rasterize_first_page(&pdf, &png).await?;
        let text = self.engine.extract_text(&png, &self.language).await?;
        Ok(text)
    }
}

#[async_trait]
impl StageHandler for OcrStage {
    type Input = OcrRequest;
    const NAME: &'static str = "ocr";

    fn outputs(&self) -> Vec<Topology> {
        vec![
            Topology::queue(&self.outputs.genai_queue),
            Topology::queue(&self.outputs.search_queue),
        ]
    }

    async fn handle(&self, input: OcrRequest, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let scratch = self.scratch_dir()?;
        let extracted = self.extract(&input, scratch.path()).await;
        let scratch_path = scratch.path().to_path_buf();
        if let Err(error) = scratch.close() {
            tracing::warn!(path = %scratch_path.display(), error = %error, "Removing scratch directory failed");
        }
        let text = extracted?;

        if text.is_empty() {
            tracing::info!(document_id = input.document_id, "No text recognised");
        }

        let produced_at_utc = Some(OffsetDateTime::now_utc());
        let genai = GenAiRequest {
            document_id: input.document_id,
            text: text.clone(),
            title: input.title.clone(),
            produced_at_utc,
        };
        let search = SearchIndexMessage {
            document_id: input.document_id,
            title: input.title,
            text,
            produced_at_utc,
        };

        publish_message(ctx.publisher, &Route::queue(&self.outputs.genai_queue), &genai).await?;
        publish_message(ctx.publisher, &Route::queue(&self.outputs.search_queue), &search).await?;

        tracing::info!(
            document_id = search.document_id,
            chars = search.text.len(),
            "Extracted text published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::messages::decode;
    use crate::storage::MemoryObjectStore;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use time::macros::datetime;

    /// Writes a fake PNG and remembers which scratch directory it was asked to use.
    #[derive(Default)]
    struct RecordingRasterizer {
        fail: bool,
        seen: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl PageRasterizer for RecordingRasterizer {
        async fn rasterize_first_page(&self, pdf: &Path, png: &Path) -> Result<(), OcrError> {
            assert!(pdf.exists(), "source must be downloaded before rendering");
            self.seen
                .lock()
                .expect("seen")
                .push(png.parent().expect("parent").to_path_buf());
            if self.fail {
                return Err(OcrError::Failed {
                    tool: "ghostscript",
                    status: "exit status: 1".into(),
                    stderr: "bad pdf".into(),
                });
            }
            tokio::fs::write(png, b"png").await?;
            Ok(())
        }
    }

    struct FixedEngine(&'static str);

    #[async_trait]
    impl OcrEngine for FixedEngine {
        async fn extract_text(&self, image: &Path, language: &str) -> Result<String, OcrError> {
            assert!(image.exists());
            assert_eq!(language, "eng");
            Ok(self.0.to_string())
        }
    }

    fn outputs() -> OcrOutputs {
        OcrOutputs {
            genai_queue: "genai-request".into(),
            search_queue: "search-index".into(),
        }
    }

    fn request() -> OcrRequest {
        OcrRequest {
            document_id: 1,
            title: "Invoice".into(),
            file_path: "a.pdf".into(),
            uploaded_at_utc: datetime!(2025-01-01 0:00 UTC),
            produced_at_utc: None,
        }
    }

    async fn store_with_pdf() -> MemoryObjectStore {
        let store = MemoryObjectStore::new("documents");
        store
            .put("a.pdf", b"%PDF-1.4 fake".to_vec(), "application/pdf")
            .await
            .expect("put");
        store
    }

    async fn handle(stage: &OcrStage, broker: &MemoryBroker) -> Result<(), StageError> {
        let cancel = CancellationToken::new();
        let ctx = StageContext {
            publisher: broker,
            cancel: &cancel,
            delivery_tag: 1,
            redelivered: false,
        };
        stage.handle(request(), &ctx).await
    }

    fn entries(root: &Path) -> usize {
        std::fs::read_dir(root).expect("read_dir").count()
    }

    #[tokio::test]
    async fn fans_out_to_both_queues_and_cleans_up() {
        let root = tempfile::tempdir().expect("root");
        let rasterizer = Arc::new(RecordingRasterizer::default());
        let stage = OcrStage::new(
            Arc::new(store_with_pdf().await),
            rasterizer.clone(),
            Arc::new(FixedEngine("hello world")),
            "eng",
            outputs(),
        )
        .with_scratch_root(root.path());
        let broker = MemoryBroker::new();

        handle(&stage, &broker).await.expect("handled");

        let published = broker.published().await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].route, Route::queue("genai-request"));
        assert_eq!(published[1].route, Route::queue("search-index"));

        let genai: GenAiRequest = decode(&published[0].body).expect("genai");
        assert_eq!((genai.document_id, genai.text.as_str(), genai.title.as_str()), (1, "hello world", "Invoice"));
        let search: SearchIndexMessage = decode(&published[1].body).expect("search");
        assert_eq!((search.document_id, search.title.as_str(), search.text.as_str()), (1, "Invoice", "hello world"));

        let used = rasterizer.seen.lock().expect("seen").clone();
        assert_eq!(used.len(), 1);
        assert!(!used[0].exists());
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn tool_failure_is_transient_and_still_cleans_up() {
        let root = tempfile::tempdir().expect("root");
        let stage = OcrStage::new(
            Arc::new(store_with_pdf().await),
            Arc::new(RecordingRasterizer {
                fail: true,
                ..RecordingRasterizer::default()
            }),
            Arc::new(FixedEngine("unused")),
            "eng",
            outputs(),
        )
        .with_scratch_root(root.path());
        let broker = MemoryBroker::new();

        let error = handle(&stage, &broker).await.expect_err("tool failure");
        assert!(error.is_transient());
        assert!(broker.published().await.is_empty());
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn missing_object_is_permanent() {
        let root = tempfile::tempdir().expect("root");
        let stage = OcrStage::new(
            Arc::new(MemoryObjectStore::new("documents")),
            Arc::new(RecordingRasterizer::default()),
            Arc::new(FixedEngine("unused")),
            "eng",
            outputs(),
        )
        .with_scratch_root(root.path());
        let broker = MemoryBroker::new();

        let error = handle(&stage, &broker).await.expect_err("missing object");
        assert!(!error.is_transient());
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn empty_recognition_still_publishes() {
        let stage = OcrStage::new(
            Arc::new(store_with_pdf().await),
            Arc::new(RecordingRasterizer::default()),
            Arc::new(FixedEngine("")),
            "eng",
            outputs(),
        );
        let broker = MemoryBroker::new();

        handle(&stage, &broker).await.expect("handled");
        let search: SearchIndexMessage =
            decode(&broker.published_to("search-index").await[0].body).expect("search");
        assert_eq!(search.text, "");
    }

    #[tokio::test]
    async fn second_publish_failure_fails_the_invocation() {
        let stage = OcrStage::new(
            Arc::new(store_with_pdf().await),
            Arc::new(RecordingRasterizer::default()),
            Arc::new(FixedEngine("hello world")),
            "eng",
            outputs(),
        );
        let broker = MemoryBroker::new();
        broker.fail_publishes_to("search-index").await;

        let error = handle(&stage, &broker).await.expect_err("publish failure");
        assert!(error.is_transient());
        assert_eq!(broker.published_to("genai-request").await.len(), 1);
        assert!(broker.published_to("search-index").await.is_empty());
    }

    #[test]
    fn declares_both_output_queues() {
        let stage = OcrStage::new(
            Arc::new(MemoryObjectStore::new("documents")),
            Arc::new(RecordingRasterizer::default()),
            Arc::new(FixedEngine("")),
            "eng",
            outputs(),
        );
        assert_eq!(
            stage.outputs(),
            vec![Topology::queue("genai-request"), Topology::queue("search-index")]
        );
    }
}
