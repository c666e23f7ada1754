use anyhow::{Context, Result, bail};
use clap::Parser;
use dms_pipeline::broker::{AmqpConnection, BrokerConnection, RetryPolicy, StageChannel, Topology};
use dms_pipeline::config;
use dms_pipeline::logging;
use dms_pipeline::pipeline::shutdown_signal;
use dms_pipeline::stages::{UploadRequest, UploadTrigger};
use dms_pipeline::storage::{ObjectStore, S3ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "dms-upload",
    about = "Store a PDF in object storage and queue it for OCR"
)]
struct Cli {
    /// Identifier of the document record the file belongs to.
    #[arg(long)]
    document_id: i64,
    /// Document title; defaults to the file name without extension.
    #[arg(long)]
    title: Option<String>,
    /// PDF file to upload.
    file: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::init_config().context("loading configuration")?;
    logging::init_tracing("upload");

    let content = tokio::fs::read(&cli.file)
        .await
        .with_context(|| format!("reading {}", cli.file.display()))?;
    let title = match cli.title {
        Some(title) => title,
        None => cli
            .file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let store = S3ObjectStore::new(&config.storage)
        .await
        .context("configuring object storage")?;
    store.ensure_bucket().await.context("preparing the bucket")?;

    let policy = RetryPolicy {
        delay: config.broker.retry_delay,
        max_attempts: config.broker.max_connect_attempts,
    };
    let uri = config.broker.amqp_uri().context("assembling broker URI")?;
    let Some(connection) = AmqpConnection::connect(&uri, policy, &cancel)
        .await
        .context("connecting to the broker")?
    else {
        bail!("interrupted before the broker was reachable");
    };

    let channel = connection
        .open_channel()
        .await
        .context("opening a broker channel")?;
    let topology = &config.topology;
    channel
        .declare_topology(&Topology::bound(
            &topology.exchange,
            &topology.ocr_queue,
            &topology.ocr_routing_key,
        ))
        .await
        .context("declaring the OCR queue")?;

    let uploader = UploadTrigger::new(
        Arc::new(store),
        &topology.exchange,
        &topology.ocr_routing_key,
    );
    let outcome = uploader
        .submit(
            &channel,
            UploadRequest {
                document_id: cli.document_id,
                title,
                content,
            },
        )
        .await;

    channel.close().await;
    connection.close().await;

    let request = outcome.context("uploading the document")?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}
