//! Message broker client: connection lifecycle, topology, publishing, and manual-ack consumption.
//!
//! The runner and stage handlers only see the traits defined here. [`amqp`] implements them on
//! top of RabbitMQ via `lapin`; [`memory`] implements them in-process for tests and local runs.

pub mod amqp;
pub mod memory;
pub mod retry;

use crate::messages::{Contract, encode};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use amqp::{AmqpChannel, AmqpConnection, AmqpConsumer};
pub use memory::{MemoryBroker, MemoryConsumer, PublishedMessage, Settlement};
pub use retry::{RetryPolicy, RetryStop, retry_with_backoff};

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped.
    #[error("broker connection failed: {0}")]
    Connection(String),
    /// A channel-level operation failed (declare, qos, consume, close).
    #[error("broker channel operation failed: {0}")]
    Channel(String),
    /// A publish was rejected or could not be confirmed.
    #[error("publish to '{route}' failed: {reason}")]
    Publish {
        /// Exchange and routing key the message was sent to.
        route: Route,
        /// Broker-reported reason.
        reason: String,
    },
    /// A message could not be serialized for publishing.
    #[error("encoding {kind} message failed: {source}")]
    Encode {
        /// Contract kind of the message.
        kind: &'static str,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },
    /// Acknowledging or rejecting a delivery failed.
    #[error("settling delivery {tag} failed: {reason}")]
    Settle {
        /// Delivery tag of the affected message.
        tag: u64,
        /// Broker-reported reason.
        reason: String,
    },
    /// The consumer stream ended (consumer cancelled or channel closed).
    #[error("consumer on queue '{0}' closed")]
    ConsumerClosed(String),
    /// Connection attempts were exhausted.
    #[error("gave up connecting to the broker after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error reported by the final attempt.
        last_error: String,
    },
}

impl From<lapin::Error> for BrokerError {
    fn from(error: lapin::Error) -> Self {
        Self::Channel(error.to_string())
    }
}

/// Destination of a publish: an exchange plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Exchange name; empty for the default (direct-to-queue) exchange.
    pub exchange: String,
    /// Routing key; the queue name when using the default exchange.
    pub routing_key: String,
}

impl Route {
    /// Publish straight to a queue through the default exchange.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: name.into(),
        }
    }

    /// Publish through a named exchange.
    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exchange.is_empty() {
            write!(f, "queue:{}", self.routing_key)
        } else {
            write!(f, "{}/{}", self.exchange, self.routing_key)
        }
    }
}

/// Exchange/queue/binding declaration for one queue. Declaring is idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable topic exchange to declare and bind to, if any.
    pub exchange: Option<String>,
    /// Durable, non-exclusive, non-auto-delete queue.
    pub queue: String,
    /// Binding key used when `exchange` is set.
    pub binding_key: Option<String>,
}

impl Topology {
    /// A bare queue reachable through the default exchange.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            exchange: None,
            queue: name.into(),
            binding_key: None,
        }
    }

    /// A queue bound to a topic exchange.
    pub fn bound(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: Some(exchange.into()),
            queue: queue.into(),
            binding_key: Some(binding_key.into()),
        }
    }
}

/// How a delivery is surrendered back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing succeeded; remove the message.
    Ack,
    /// Transient failure; return the message to the queue.
    Requeue,
    /// Permanent failure; drop the message without requeue.
    Discard,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ack => "ack",
            Self::Requeue => "nack-requeue",
            Self::Discard => "nack-discard",
        })
    }
}

/// Broker-specific acknowledgement handle behind a [`Delivery`].
#[async_trait]
pub trait Acker: Send {
    /// Settle the delivery. Consumes the handle so it can only be used once.
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError>;
}

/// One received message together with the handle used to settle it.
pub struct Delivery {
    /// Broker-issued delivery tag.
    pub tag: u64,
    /// Whether the broker flagged this as a redelivery.
    pub redelivered: bool,
    /// Raw message body.
    pub body: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Wrap a message body and its acknowledgement handle.
    pub fn new(tag: u64, redelivered: bool, body: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self {
            tag,
            redelivered,
            body,
            acker,
        }
    }

    /// Surrender the delivery with exactly one disposition.
    pub async fn settle(self, disposition: Disposition) -> Result<(), BrokerError> {
        self.acker.settle(disposition).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Source of deliveries for a single consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Name of the consumed queue.
    fn queue(&self) -> &str;

    /// Wait for the next delivery. `None` means the consumer is gone.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Sink for outgoing messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a persistent JSON message. Returns only once the broker accepted it.
    async fn publish(&self, route: &Route, kind: &str, body: Vec<u8>) -> Result<(), BrokerError>;
}

/// Channel operations a stage session needs besides publishing.
#[async_trait]
pub trait StageChannel: Publisher + Sized {
    /// Consumer handed out by [`StageChannel::consume`].
    type Consumer: DeliveryStream;

    /// Declare the exchange (if any), the queue, and the binding. Safe to repeat.
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Register a manual-ack consumer with the given prefetch.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Self::Consumer, BrokerError>;

    /// Cancel `consumer` and close the channel after a clean stop.
    async fn shutdown(self, consumer: Self::Consumer);
}

/// An owned connection that opens channels and is replaced, never repaired, after a failure.
#[async_trait]
pub trait BrokerConnection: Send + Sync + Sized {
    /// Channel type opened on this connection.
    type Channel: StageChannel;

    /// Whether the underlying connection is still usable.
    fn is_connected(&self) -> bool;

    /// Open a channel for one session.
    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Close this connection (best effort) and dial a new one.
    ///
    /// Returns `Ok(None)` when `cancel` fires before the new connection is established.
    async fn reconnect(self, cancel: &CancellationToken) -> Result<Option<Self>, BrokerError>;

    /// Close the connection.
    async fn close(self);
}

/// Encode a contract and publish it.
pub async fn publish_message<M: Contract>(
    publisher: &dyn Publisher,
    route: &Route,
    message: &M,
) -> Result<(), BrokerError> {
    let body = encode(message).map_err(|source| BrokerError::Encode {
        kind: M::KIND,
        source,
    })?;
    let size = body.len();
    publisher.publish(route, M::KIND, body).await?;
    tracing::debug!(
        document_id = message.document_id(),
        kind = M::KIND,
        route = %route,
        bytes = size,
        "Published message"
    );
    Ok(())
}
