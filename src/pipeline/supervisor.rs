//! Keeps one stage attached to RabbitMQ: connect, declare, consume, reconnect, shut down.

use super::{RunExit, StageHandler, StageRunner};
use crate::broker::{
    AmqpConnection, BrokerConnection, BrokerError, RetryPolicy, StageChannel, Topology,
};
use crate::metrics::StageMetricsSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Unacknowledged deliveries allowed per consumer. One keeps each worker strictly serial.
pub const PREFETCH: u16 = 1;

/// Where a stage reads from and which queues it needs to exist before it publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBinding {
    /// Input queue, optionally bound to an exchange.
    pub input: Topology,
    /// Queues the stage publishes to.
    pub outputs: Vec<Topology>,
}

impl StageBinding {
    /// Bind a handler's declared outputs to an input queue.
    pub fn for_handler<H: StageHandler>(input: Topology, handler: &H) -> Self {
        Self {
            input,
            outputs: handler.outputs(),
        }
    }

    /// Every topology the stage declares, input first.
    pub fn declarations(&self) -> impl Iterator<Item = &Topology> {
        std::iter::once(&self.input).chain(self.outputs.iter())
    }
}

/// Broker session settings for one stage process.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Fully assembled AMQP URI.
    pub amqp_uri: String,
    /// Connection retry behaviour.
    pub retry: RetryPolicy,
    /// Optional bound on a single handler invocation.
    pub handler_timeout: Option<Duration>,
}

/// Run `handler` until `cancel` fires.
///
/// Connection loss is never fatal: see [`supervise`]. The only error returned is an exhausted
/// bounded retry.
pub async fn run_stage<H: StageHandler>(
    settings: &SupervisorSettings,
    binding: StageBinding,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Result<StageMetricsSnapshot, BrokerError> {
    let runner = StageRunner::new(handler).with_timeout(settings.handler_timeout);

    let Some(connection) =
        AmqpConnection::connect(&settings.amqp_uri, settings.retry, &cancel).await?
    else {
        tracing::info!(stage = H::NAME, "Shutdown requested before the broker was reachable");
        return Ok(runner.metrics().snapshot());
    };

    supervise(connection, &runner, &binding, settings.retry.delay, &cancel).await
}

/// Serve sessions on `connection` until `cancel` fires.
///
/// A failed session is torn down, `retry_delay` elapses, the connection is replaced through
/// [`BrokerConnection::reconnect`], topology is declared again, and consumption resumes.
pub async fn supervise<C: BrokerConnection, H: StageHandler>(
    mut connection: C,
    runner: &StageRunner<H>,
    binding: &StageBinding,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Result<StageMetricsSnapshot, BrokerError> {
    loop {
        match serve(&connection, binding, runner, cancel).await {
            Ok(RunExit::Cancelled) => break,
            Err(error) if cancel.is_cancelled() => {
                tracing::debug!(stage = H::NAME, error = %error, "Session ended during shutdown");
                break;
            }
            Err(error) => {
                tracing::warn!(
                    stage = H::NAME,
                    queue = %binding.input.queue,
                    connected = connection.is_connected(),
                    error = %error,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Broker session lost"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                match connection.reconnect(cancel).await? {
                    Some(fresh) => connection = fresh,
                    None => {
                        let snapshot = runner.metrics().snapshot();
                        log_summary::<H>(&snapshot);
                        return Ok(snapshot);
                    }
                }
            }
        }
    }

    connection.close().await;
    let snapshot = runner.metrics().snapshot();
    log_summary::<H>(&snapshot);
    Ok(snapshot)
}

async fn serve<C: BrokerConnection, H: StageHandler>(
    connection: &C,
    binding: &StageBinding,
    runner: &StageRunner<H>,
    cancel: &CancellationToken,
) -> Result<RunExit, BrokerError> {
    let channel = connection.open_channel().await?;
    for topology in binding.declarations() {
        channel.declare_topology(topology).await?;
    }

    let mut consumer = channel.consume(&binding.input.queue, PREFETCH).await?;
    let outcome = runner.run(&mut consumer, &channel, cancel).await;

    if outcome.is_ok() {
        channel.shutdown(consumer).await;
    }
    outcome
}

fn log_summary<H: StageHandler>(snapshot: &StageMetricsSnapshot) {
    tracing::info!(
        stage = H::NAME,
        received = snapshot.received,
        acked = snapshot.acked,
        requeued = snapshot.requeued,
        discarded = snapshot.discarded,
        timed_out = snapshot.timed_out,
        "Stage stopped"
    );
}

/// Resolve once the process receives Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "Installing Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "Installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
