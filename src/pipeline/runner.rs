//! The ack/nack contract shared by every stage.

use super::{StageContext, StageError, StageHandler};
use crate::broker::{BrokerError, Delivery, DeliveryStream, Disposition, Publisher};
use crate::messages::{Contract, decode};
use crate::metrics::StageMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why [`StageRunner::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Shutdown was requested; no delivery is in flight.
    Cancelled,
}

/// Drives one handler over a stream of deliveries, strictly one at a time.
pub struct StageRunner<H: StageHandler> {
    handler: Arc<H>,
    timeout: Option<Duration>,
    metrics: Arc<StageMetrics>,
}

impl<H: StageHandler> StageRunner<H> {
    /// Wrap a handler with no invocation timeout.
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            timeout: None,
            metrics: Arc::new(StageMetrics::new()),
        }
    }

    /// Bound each handler invocation; expiry counts as a transient failure.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Counters shared with the caller.
    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }

    /// Consume until shutdown or until the broker session breaks.
    ///
    /// Cancellation is only observed between deliveries: a handler that has started always
    /// runs to completion and its delivery is settled before this returns.
    pub async fn run(
        &self,
        deliveries: &mut dyn DeliveryStream,
        publisher: &dyn Publisher,
        cancel: &CancellationToken,
    ) -> Result<RunExit, BrokerError> {
        let queue = deliveries.queue().to_string();
        tracing::info!(stage = H::NAME, queue = %queue, "Stage consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(stage = H::NAME, queue = %queue, "Stage stopping");
                    return Ok(RunExit::Cancelled);
                }
                next = deliveries.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => return Err(error),
                None => return Err(BrokerError::ConsumerClosed(queue)),
            };

            self.process(delivery, &queue, publisher, cancel).await?;
        }
    }

    /// Handle and settle a single delivery, returning the disposition used.
    pub async fn process(
        &self,
        delivery: Delivery,
        queue: &str,
        publisher: &dyn Publisher,
        cancel: &CancellationToken,
    ) -> Result<Disposition, BrokerError> {
        self.metrics.record_received();
        let ctx = StageContext {
            publisher,
            cancel,
            delivery_tag: delivery.tag,
            redelivered: delivery.redelivered,
        };
        let disposition = self.evaluate(&delivery.body, queue, &ctx).await;

        let tag = delivery.tag;
        delivery.settle(disposition).await?;
        self.metrics.record_disposition(disposition);
        tracing::debug!(stage = H::NAME, queue, delivery_tag = tag, %disposition, "Delivery settled");
        Ok(disposition)
    }

    async fn evaluate(&self, body: &[u8], queue: &str, ctx: &StageContext<'_>) -> Disposition {
        let input = match decode::<H::Input>(body) {
            Ok(input) => input,
            Err(error) => {
                tracing::error!(
                    stage = H::NAME,
                    queue,
                    delivery_tag = ctx.delivery_tag,
                    bytes = body.len(),
                    error = %error,
                    "Discarding undecodable message"
                );
                return Disposition::Discard;
            }
        };

        let document_id = input.document_id();
        tracing::info!(
            stage = H::NAME,
            document_id,
            delivery_tag = ctx.delivery_tag,
            redelivered = ctx.redelivered,
            "Handling message"
        );

        let outcome = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.handler.handle(input, ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.metrics.record_timeout();
                        Err(StageError::Transient(format!(
                            "handler exceeded {} ms",
                            limit.as_millis()
                        )))
                    }
                }
            }
            None => self.handler.handle(input, ctx).await,
        };

        match outcome {
            Ok(()) => {
                tracing::info!(stage = H::NAME, document_id, "Message processed");
                Disposition::Ack
            }
            Err(error) if error.is_transient() => {
                tracing::warn!(stage = H::NAME, document_id, error = %error, "Requeueing message");
                error.disposition()
            }
            Err(error) => {
                tracing::error!(stage = H::NAME, document_id, error = %error, "Discarding message");
                error.disposition()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Route, publish_message};
    use crate::messages::SearchIndexMessage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUEUE: &str = "search-index";

    /// Handler whose outcome is chosen by the message title.
    #[derive(Default)]
    struct ScriptedHandler {
        active: AtomicUsize,
        max_active: AtomicUsize,
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl StageHandler for ScriptedHandler {
        type Input = SearchIndexMessage;
        const NAME: &'static str = "scripted";

        async fn handle(
            &self,
            input: SearchIndexMessage,
            _ctx: &StageContext<'_>,
        ) -> Result<(), StageError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seen.lock().expect("seen").push(input.document_id);
            self.active.fetch_sub(1, Ordering::SeqCst);

            match input.title.as_str() {
                "transient" => Err(StageError::transient("dependency down")),
                "permanent" => Err(StageError::permanent("rule violated")),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    fn message(id: i64, title: &str) -> SearchIndexMessage {
        SearchIndexMessage {
            document_id: id,
            title: title.into(),
            text: "body".into(),
            produced_at_utc: None,
        }
    }

    async fn settle_one(
        runner: &StageRunner<ScriptedHandler>,
        broker: &MemoryBroker,
        body: Vec<u8>,
    ) -> Disposition {
        broker
            .publish(&Route::queue(QUEUE), "test", body)
            .await
            .expect("publish");
        let mut consumer = broker.consume(QUEUE);
        let delivery = consumer
            .next_delivery()
            .await
            .expect("delivery")
            .expect("ok");
        runner
            .process(delivery, QUEUE, broker, &CancellationToken::new())
            .await
            .expect("settle")
    }

    #[tokio::test]
    async fn maps_outcomes_to_dispositions() {
        let broker = MemoryBroker::new();
        let runner = StageRunner::new(Arc::new(ScriptedHandler::default()));

        let ok = crate::messages::encode(&message(1, "fine")).expect("encode");
        let transient = crate::messages::encode(&message(2, "transient")).expect("encode");
        let permanent = crate::messages::encode(&message(3, "permanent")).expect("encode");

        assert_eq!(settle_one(&runner, &broker, ok).await, Disposition::Ack);
        assert_eq!(settle_one(&runner, &broker, transient).await, Disposition::Requeue);
        // the requeued message is back at the head; drain it before the next case
        let mut consumer = broker.consume(QUEUE);
        let requeued = consumer.next_delivery().await.expect("delivery").expect("ok");
        assert!(requeued.redelivered);
        requeued.settle(Disposition::Discard).await.expect("discard");

        assert_eq!(settle_one(&runner, &broker, permanent).await, Disposition::Discard);
        assert_eq!(
            settle_one(&runner, &broker, b"{not json".to_vec()).await,
            Disposition::Discard
        );

        let snapshot = runner.metrics().snapshot();
        assert_eq!(snapshot.received, 4);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.discarded, 2);
    }

    #[tokio::test]
    async fn timeout_requeues_slow_handlers() {
        let broker = MemoryBroker::new();
        let runner = StageRunner::new(Arc::new(ScriptedHandler::default()))
            .with_timeout(Some(Duration::from_millis(50)));

        let slow = crate::messages::encode(&message(4, "slow")).expect("encode");
        let disposition = settle_one(&runner, &broker, slow).await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(runner.metrics().snapshot().timed_out, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn processes_deliveries_one_at_a_time() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(ScriptedHandler::default());
        let runner = StageRunner::new(handler.clone());

        let mut publishers = Vec::new();
        for id in 1..=20 {
            let broker = broker.clone();
            publishers.push(tokio::spawn(async move {
                publish_message(&broker, &Route::queue(QUEUE), &message(id, "fine"))
                    .await
                    .expect("publish");
            }));
        }
        for publisher in publishers {
            publisher.await.expect("publisher task");
        }

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let watcher = broker.clone();
        tokio::spawn(async move {
            while watcher.settlements().await.len() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        let mut consumer = broker.consume(QUEUE);
        let exit = runner
            .run(&mut consumer, &broker, &cancel)
            .await
            .expect("run");

        assert_eq!(exit, RunExit::Cancelled);
        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(handler.seen.lock().expect("seen").len(), 20);
    }

    #[tokio::test]
    async fn poison_message_does_not_block_the_queue() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(ScriptedHandler::default());
        let runner = StageRunner::new(handler.clone());
        let route = Route::queue(QUEUE);

        broker
            .publish(&route, "test", b"\x00\x01garbage".to_vec())
            .await
            .expect("publish");
        publish_message(&broker, &route, &message(5, "fine"))
            .await
            .expect("publish");

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let watcher = broker.clone();
        tokio::spawn(async move {
            while watcher.settlements().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        let mut consumer = broker.consume(QUEUE);
        runner
            .run(&mut consumer, &broker, &cancel)
            .await
            .expect("run");

        let dispositions: Vec<_> = broker
            .settlements()
            .await
            .into_iter()
            .map(|settlement| settlement.disposition)
            .collect();
        assert_eq!(dispositions, vec![Disposition::Discard, Disposition::Ack]);
        assert_eq!(*handler.seen.lock().expect("seen"), vec![5]);
        assert_eq!(broker.queue_depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn stops_between_deliveries_and_leaves_the_rest_queued() {
        let broker = MemoryBroker::new();
        let runner = StageRunner::new(Arc::new(ScriptedHandler::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        publish_message(&broker, &Route::queue(QUEUE), &message(6, "fine"))
            .await
            .expect("publish");
        let mut consumer = broker.consume(QUEUE);
        let exit = runner
            .run(&mut consumer, &broker, &cancel)
            .await
            .expect("run");

        assert_eq!(exit, RunExit::Cancelled);
        assert_eq!(broker.queue_depth(QUEUE).await, 1);
        assert!(broker.settlements().await.is_empty());
    }

    #[tokio::test]
    async fn closed_consumer_is_reported_to_the_supervisor() {
        let broker = MemoryBroker::new();
        let runner = StageRunner::new(Arc::new(ScriptedHandler::default()));
        broker.close_queue(QUEUE).await;

        let mut consumer = broker.consume(QUEUE);
        let error = runner
            .run(&mut consumer, &broker, &CancellationToken::new())
            .await
            .expect_err("closed consumer");
        assert!(matches!(error, BrokerError::ConsumerClosed(queue) if queue == QUEUE));
    }
}
