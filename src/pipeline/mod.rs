//! Generic pipeline-stage machinery: handler contract, runner, and supervisor.
//!
//! A stage is a typed handler bound to one input queue. The [`runner::StageRunner`] owns every
//! delivery for the duration of one handler call and settles it exactly once; the
//! [`supervisor`] keeps a broker session alive around the runner.

pub mod runner;
pub mod supervisor;

use crate::broker::{BrokerError, Disposition, Publisher, Topology};
use crate::documents::DocumentStoreError;
use crate::messages::Contract;
use crate::ocr::OcrError;
use crate::search::SearchIndexError;
use crate::storage::StorageError;
use crate::summarization::SummarizationClientError;
use async_trait::async_trait;
use std::fmt::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use runner::{RunExit, StageRunner};
pub use supervisor::{StageBinding, SupervisorSettings, run_stage, shutdown_signal, supervise};

/// Failure reported by a stage handler, classified by whether a retry can help.
#[derive(Debug, Error)]
pub enum StageError {
    /// A dependency or external tool failed; the message is requeued.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The message can never succeed; it is discarded.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl StageError {
    /// Build a transient failure from any displayable error.
    pub fn transient(error: impl Display) -> Self {
        Self::Transient(error.to_string())
    }

    /// Build a permanent failure from any displayable error.
    pub fn permanent(error: impl Display) -> Self {
        Self::Permanent(error.to_string())
    }

    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Broker disposition for this failure.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Transient(_) => Disposition::Requeue,
            Self::Permanent(_) => Disposition::Discard,
        }
    }
}

impl From<BrokerError> for StageError {
    fn from(error: BrokerError) -> Self {
        Self::transient(error)
    }
}

impl From<StorageError> for StageError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound(_) => Self::permanent(error),
            _ => Self::transient(error),
        }
    }
}

impl From<OcrError> for StageError {
    fn from(error: OcrError) -> Self {
        Self::transient(error)
    }
}

impl From<SummarizationClientError> for StageError {
    fn from(error: SummarizationClientError) -> Self {
        match error {
            SummarizationClientError::InvalidResponse(_) => Self::permanent(error),
            _ => Self::transient(error),
        }
    }
}

impl From<SearchIndexError> for StageError {
    fn from(error: SearchIndexError) -> Self {
        Self::transient(error)
    }
}

impl From<DocumentStoreError> for StageError {
    fn from(error: DocumentStoreError) -> Self {
        match error {
            DocumentStoreError::NotFound(_) => Self::permanent(error),
            _ => Self::transient(error),
        }
    }
}

/// Per-invocation view of the broker session handed to a handler.
pub struct StageContext<'a> {
    /// Publisher bound to the current broker session.
    pub publisher: &'a dyn Publisher,
    /// Fires when the process is shutting down.
    pub cancel: &'a CancellationToken,
    /// Delivery tag of the message being handled.
    pub delivery_tag: u64,
    /// Whether the broker flagged the message as a redelivery.
    pub redelivered: bool,
}

/// Stage-specific processing logic.
///
/// The runner takes care of decoding, acknowledgement, timeouts, and logging; handlers only
/// perform their side effects and publish follow-up messages through the context.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    /// Contract consumed from the input queue.
    type Input: Contract;

    /// Stage name used in logs.
    const NAME: &'static str;

    /// Queues this stage publishes to; declared before consuming starts.
    fn outputs(&self) -> Vec<Topology> {
        Vec::new()
    }

    /// Process one decoded message.
    async fn handle(&self, input: Self::Input, ctx: &StageContext<'_>) -> Result<(), StageError>;
}
