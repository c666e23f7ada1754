use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use dms_pipeline::broker::{RetryPolicy, RetryStop, Topology, retry_with_backoff};
use dms_pipeline::config::{self, Config};
use dms_pipeline::documents::HttpDocumentStore;
use dms_pipeline::logging;
use dms_pipeline::metrics::StageMetricsSnapshot;
use dms_pipeline::ocr::{GhostscriptRasterizer, TesseractEngine};
use dms_pipeline::pipeline::{
    StageBinding, StageHandler, SupervisorSettings, run_stage, shutdown_signal,
};
use dms_pipeline::search::{ElasticsearchService, SearchIndex};
use dms_pipeline::stages::ocr::OcrOutputs;
use dms_pipeline::stages::{ApplyResultStage, IndexStage, OcrStage, SummarizeStage};
use dms_pipeline::storage::S3ObjectStore;
use dms_pipeline::summarization::GeminiClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dms-worker", about = "Run one stage of the document pipeline")]
struct Cli {
    /// Stage to run in this process.
    #[arg(value_enum)]
    stage: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    /// Download, rasterize and recognise uploaded PDFs.
    Ocr,
    /// Summarize extracted text.
    Summarize,
    /// Write extracted text to the search index.
    Index,
    /// Store generated summaries in the metadata API.
    ApplyResult,
}

impl Stage {
    fn process_name(self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Summarize => "summarize",
            Self::Index => "index",
            Self::ApplyResult => "apply-result",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli.stage).await {
        tracing::error!(error = %format!("{err:#}"), "Worker failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(stage: Stage) -> Result<()> {
    let config = config::init_config().context("loading configuration")?;
    logging::init_tracing(stage.process_name());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let settings = SupervisorSettings {
        amqp_uri: config.broker.amqp_uri().context("assembling broker URI")?,
        retry: RetryPolicy {
            delay: config.broker.retry_delay,
            max_attempts: config.broker.max_connect_attempts,
        },
        handler_timeout: config.handler_timeout,
    };
    tracing::info!(stage = stage.process_name(), "Starting worker");

    let snapshot = match stage {
        Stage::Ocr => {
            let handler = build_ocr(config).await?;
            let input = Topology::bound(
                &config.topology.exchange,
                &config.topology.ocr_queue,
                &config.topology.ocr_routing_key,
            );
            serve(&settings, input, handler, cancel).await?
        }
        Stage::Summarize => {
            let client = GeminiClient::new(&config.genai)
                .context("the summarize stage requires GEMINI_API_KEY")?;
            let handler =
                SummarizeStage::new(Arc::new(client), &config.topology.genai_result_queue);
            let input = Topology::queue(&config.topology.genai_queue);
            serve(&settings, input, handler, cancel).await?
        }
        Stage::Index => {
            let index =
                ElasticsearchService::new(&config.search).context("configuring Elasticsearch")?;
            if !wait_for_index(&index, settings.retry, &cancel).await? {
                return Ok(());
            }
            let handler = IndexStage::new(Arc::new(index));
            let input = Topology::queue(&config.topology.search_queue);
            serve(&settings, input, handler, cancel).await?
        }
        Stage::ApplyResult => {
            let documents = HttpDocumentStore::new(&config.dms_api_url)
                .context("configuring the metadata API client")?;
            let handler = ApplyResultStage::new(Arc::new(documents));
            let input = Topology::queue(&config.topology.genai_result_queue);
            serve(&settings, input, handler, cancel).await?
        }
    };

    tracing::info!(
        stage = stage.process_name(),
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Worker exiting"
    );
    Ok(())
}

async fn build_ocr(config: &Config) -> Result<OcrStage> {
    let store = S3ObjectStore::new(&config.storage)
        .await
        .context("configuring object storage")?;
    Ok(OcrStage::new(
        Arc::new(store),
        Arc::new(GhostscriptRasterizer::new(
            &config.ocr.ghostscript_bin,
            config.ocr.raster_dpi,
        )),
        Arc::new(TesseractEngine::new(&config.ocr.tesseract_bin)),
        &config.ocr.language,
        OcrOutputs {
            genai_queue: config.topology.genai_queue.clone(),
            search_queue: config.topology.search_queue.clone(),
        },
    ))
}

/// Returns `false` when shutdown was requested before the index became available.
async fn wait_for_index(
    index: &ElasticsearchService,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<bool> {
    match retry_with_backoff("search-index", policy, cancel, || index.ensure_index()).await {
        Ok(()) => Ok(true),
        Err(RetryStop::Cancelled) => Ok(false),
        Err(RetryStop::Exhausted {
            attempts,
            last_error,
        }) => bail!("search index unavailable after {attempts} attempts: {last_error}"),
    }
}

async fn serve<H: StageHandler>(
    settings: &SupervisorSettings,
    input: Topology,
    handler: H,
    cancel: CancellationToken,
) -> Result<StageMetricsSnapshot> {
    let binding = StageBinding::for_handler(input, &handler);
    run_stage(settings, binding, Arc::new(handler), cancel)
        .await
        .with_context(|| format!("{} stage stopped", H::NAME))
}
