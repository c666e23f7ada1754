//! RabbitMQ implementation of the broker traits on top of `lapin`.

use super::retry::{RetryPolicy, RetryStop, retry_with_backoff};
use super::{
    Acker, BrokerConnection, BrokerError, Delivery, DeliveryStream, Disposition, Publisher, Route,
    StageChannel, Topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

const CONTENT_TYPE_JSON: &str = "application/json";
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// An owned broker connection.
///
/// Reconnecting never mutates a shared handle: [`BrokerConnection::reconnect`] consumes the old
/// connection and returns a fresh one.
pub struct AmqpConnection {
    uri: String,
    policy: RetryPolicy,
    connection: Connection,
}

impl AmqpConnection {
    /// Dial the broker, retrying with a fixed delay per `policy`.
    ///
    /// Returns `Ok(None)` when `cancel` fires before a connection is established.
    pub async fn connect(
        uri: &str,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>, BrokerError> {
        let attempt = retry_with_backoff("amqp-connect", policy, cancel, || async {
            Connection::connect(uri, ConnectionProperties::default()).await
        })
        .await;

        match attempt {
            Ok(connection) => {
                tracing::info!(host = %redact(uri), "Connected to broker");
                Ok(Some(Self {
                    uri: uri.to_string(),
                    policy,
                    connection,
                }))
            }
            Err(RetryStop::Cancelled) => Ok(None),
            Err(RetryStop::Exhausted {
                attempts,
                last_error,
            }) => Err(BrokerError::RetriesExhausted {
                attempts,
                last_error: last_error.to_string(),
            }),
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn reconnect(self, cancel: &CancellationToken) -> Result<Option<Self>, BrokerError> {
        let Self {
            uri,
            policy,
            connection,
        } = self;
        if connection.status().connected()
            && let Err(error) = connection.close(REPLY_SUCCESS, "reconnecting").await
        {
            tracing::debug!(error = %error, "Closing stale connection failed");
        }
        tracing::warn!(host = %redact(&uri), "Reconnecting to broker");
        AmqpConnection::connect(&uri, policy, cancel).await
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Opens a channel with publisher confirms enabled.
    async fn open_channel(&self) -> Result<AmqpChannel, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|error| BrokerError::Connection(error.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(AmqpChannel { channel })
    }

    async fn close(self) {
        if let Err(error) = self.connection.close(REPLY_SUCCESS, "shutdown").await {
            tracing::debug!(error = %error, "Closing connection failed");
        }
    }
}

/// A channel used for declaring topology, publishing, and consuming.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    /// Close the channel.
    pub async fn close(self) {
        if let Err(error) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
            tracing::debug!(error = %error, "Closing channel failed");
        }
    }
}

#[async_trait]
impl StageChannel for AmqpChannel {
    type Consumer = AmqpConsumer;

    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        if let Some(exchange) = &topology.exchange {
            self.channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        self.channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        if let (Some(exchange), Some(binding_key)) = (&topology.exchange, &topology.binding_key) {
            self.channel
                .queue_bind(
                    &topology.queue,
                    exchange,
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        tracing::debug!(
            queue = %topology.queue,
            exchange = ?topology.exchange,
            binding_key = ?topology.binding_key,
            "Topology declared"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<AmqpConsumer, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let tag = format!("dms-{queue}-{}", uuid::Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue, consumer_tag = %tag, prefetch, "Consumer registered");
        Ok(AmqpConsumer {
            channel: self.channel.clone(),
            queue: queue.to_string(),
            tag,
            consumer,
        })
    }

    async fn shutdown(self, consumer: AmqpConsumer) {
        consumer.cancel().await;
        self.close().await;
    }
}

/// Persistent JSON properties carrying the contract kind in the AMQP `type` field.
fn message_properties(kind: &str, now: OffsetDateTime) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
        .with_delivery_mode(PERSISTENT)
        .with_type(ShortString::from(kind))
        .with_timestamp(now.unix_timestamp().max(0) as u64)
}

#[async_trait]
impl Publisher for AmqpChannel {
    async fn publish(&self, route: &Route, kind: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let publish_error = |reason: String| BrokerError::Publish {
            route: route.clone(),
            reason,
        };
        let properties = message_properties(kind, OffsetDateTime::now_utc());

        let confirmation = self
            .channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|error| publish_error(error.to_string()))?
            .await
            .map_err(|error| publish_error(error.to_string()))?;

        if confirmation.is_nack() {
            return Err(publish_error("broker returned a negative confirm".into()));
        }
        Ok(())
    }
}

/// Manual-ack consumer bound to one queue.
pub struct AmqpConsumer {
    channel: Channel,
    queue: String,
    tag: String,
    consumer: Consumer,
}

impl AmqpConsumer {
    /// Stop receiving deliveries. Messages already delivered stay owned by the caller.
    pub async fn cancel(&self) {
        if let Err(error) = self
            .channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
        {
            tracing::debug!(queue = %self.queue, error = %error, "Cancelling consumer failed");
        }
    }
}

#[async_trait]
impl DeliveryStream for AmqpConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| {
                let tag = delivery.delivery_tag;
                Delivery::new(
                    tag,
                    delivery.redelivered,
                    delivery.data,
                    Box::new(LapinAcker {
                        tag,
                        acker: delivery.acker,
                    }),
                )
            })
            .map_err(|error| BrokerError::Connection(error.to_string())),
        )
    }
}

struct LapinAcker {
    tag: u64,
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        let result = match disposition {
            Disposition::Ack => self.acker.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => {
                self.acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
            }
            Disposition::Discard => {
                self.acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
            }
        };
        result.map_err(|error| BrokerError::Settle {
            tag: self.tag,
            reason: error.to_string(),
        })
    }
}

/// Strip credentials from an AMQP URI for logging.
fn redact(uri: &str) -> String {
    match uri.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
            format!("{scheme}://{host}")
        }
        None => uri.to_string(),
    }
}
