//! In-process broker with RabbitMQ-like semantics for tests and local experiments.
//!
//! Queues are FIFO, requeued messages go back to the head and are flagged as redelivered,
//! topic exchanges route through declared bindings (`*` matches one word, `#` zero or more).
//! Every publish and settlement is recorded so tests can assert on them.

use super::{
    Acker, BrokerConnection, BrokerError, Delivery, DeliveryStream, Disposition, Publisher, Route,
    StageChannel, Topology,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Route the message was published to.
    pub route: Route,
    /// Contract kind supplied by the publisher.
    pub kind: String,
    /// JSON body.
    pub body: Vec<u8>,
}

/// A recorded ack/nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Queue the delivery came from.
    pub queue: String,
    /// Delivery tag.
    pub tag: u64,
    /// How the delivery was settled.
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
    closed: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    next_tag: u64,
    published: Vec<PublishedMessage>,
    settlements: Vec<Settlement>,
    failing_routes: HashSet<String>,
    failing_declares: usize,
    channel_openings: Vec<Instant>,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        let state = self.queue_mut(queue);
        state.ready.push_back(message);
        state.notify.notify_one();
    }
}

/// Shared handle to an in-memory broker. Clones observe the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue and, when present, its topic binding.
    pub async fn declare(&self, topology: &Topology) {
        let mut state = self.state.lock().await;
        state.queue_mut(&topology.queue);
        if let (Some(exchange), Some(key)) = (&topology.exchange, &topology.binding_key) {
            let binding = (exchange.clone(), key.clone(), topology.queue.clone());
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }
    }

    /// Start consuming a queue.
    pub fn consume(&self, queue: &str) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
        }
    }

    /// Make publishes whose routing key equals `routing_key` fail.
    pub async fn fail_publishes_to(&self, routing_key: &str) {
        self.state
            .lock()
            .await
            .failing_routes
            .insert(routing_key.to_string());
    }

    /// Undo [`MemoryBroker::fail_publishes_to`].
    pub async fn restore_publishes_to(&self, routing_key: &str) {
        self.state.lock().await.failing_routes.remove(routing_key);
    }

    /// Make the next `count` declarations through [`StageChannel::declare_topology`] fail.
    pub async fn fail_next_declares(&self, count: usize) {
        self.state.lock().await.failing_declares = count;
    }

    /// When each channel was opened through [`BrokerConnection::open_channel`].
    pub async fn channel_openings(&self) -> Vec<Instant> {
        self.state.lock().await.channel_openings.clone()
    }

    /// End every consumer of `queue`; their streams yield `None` once drained of waiters.
    pub async fn close_queue(&self, queue: &str) {
        let mut state = self.state.lock().await;
        let entry = state.queue_mut(queue);
        entry.closed = true;
        entry.notify.notify_one();
    }

    /// Number of messages ready for delivery on `queue`.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Bodies of the messages ready on `queue`, head first.
    pub async fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|state| state.ready.iter().map(|message| message.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Every publish accepted so far, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    /// Publishes accepted for a given routing key.
    pub async fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|message| message.route.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Every settlement recorded so far, in order.
    pub async fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().await.settlements.clone()
    }

    async fn next_from(&self, queue: &str) -> Option<Delivery> {
        loop {
            let notify = {
                let mut state = self.state.lock().await;
                if let Some(message) = state.queue_mut(queue).ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let redelivered = message.redelivered;
                    let body = message.body.clone();
                    let acker = MemoryAcker {
                        broker: self.clone(),
                        queue: queue.to_string(),
                        tag,
                        message,
                    };
                    return Some(Delivery::new(tag, redelivered, body, Box::new(acker)));
                }
                let entry = state.queue_mut(queue);
                if entry.closed {
                    return None;
                }
                entry.notify.clone()
            };
            notify.notified().await;
        }
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, route: &Route, kind: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.failing_routes.contains(&route.routing_key) {
            return Err(BrokerError::Publish {
                route: route.clone(),
                reason: "channel closed".into(),
            });
        }

        let targets: Vec<String> = if route.exchange.is_empty() {
            vec![route.routing_key.clone()]
        } else {
            state
                .bindings
                .iter()
                .filter(|(exchange, pattern, _)| {
                    exchange == &route.exchange && topic_matches(pattern, &route.routing_key)
                })
                .map(|(_, _, queue)| queue.clone())
                .collect()
        };

        for queue in targets {
            state.enqueue(
                &queue,
                StoredMessage {
                    body: body.clone(),
                    redelivered: false,
                },
            );
        }
        state.published.push(PublishedMessage {
            route: route.clone(),
            kind: kind.to_string(),
            body,
        });
        Ok(())
    }
}

/// Consumer handle returned by [`MemoryBroker::consume`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    queue: String,
}

#[async_trait]
impl DeliveryStream for MemoryConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        self.broker.next_from(&self.queue).await.map(Ok)
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
    message: StoredMessage,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        let Self {
            broker,
            queue,
            tag,
            mut message,
        } = *self;
        let mut state = broker.state.lock().await;
        if disposition == Disposition::Requeue {
            message.redelivered = true;
            let entry = state.queue_mut(&queue);
            entry.ready.push_front(message);
            entry.notify.notify_one();
        }
        state.settlements.push(Settlement {
            queue,
            tag,
            disposition,
        });
        Ok(())
    }
}

#[async_trait]
impl StageChannel for MemoryBroker {
    type Consumer = MemoryConsumer;

    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            if state.failing_declares > 0 {
                state.failing_declares -= 1;
                return Err(BrokerError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    topology.queue
                )));
            }
        }
        self.declare(topology).await;
        Ok(())
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> Result<MemoryConsumer, BrokerError> {
        Ok(MemoryBroker::consume(self, queue))
    }

    async fn shutdown(self, _consumer: MemoryConsumer) {}
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    type Channel = MemoryBroker;

    fn is_connected(&self) -> bool {
        true
    }

    async fn open_channel(&self) -> Result<MemoryBroker, BrokerError> {
        self.state.lock().await.channel_openings.push(Instant::now());
        Ok(self.clone())
    }

    async fn reconnect(self, cancel: &CancellationToken) -> Result<Option<Self>, BrokerError> {
        Ok((!cancel.is_cancelled()).then_some(self))
    }

    async fn close(self) {}
}

/// AMQP topic matching: words split on `.`, `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(candidate)) if word == candidate => {
                matches(&pattern[1..], &key[1..])
            }
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
