use std::sync::atomic::{AtomicU64, Ordering};

use crate::broker::Disposition;

/// Thread-safe counters describing how a stage settled its deliveries.
#[derive(Default)]
pub struct StageMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    timed_out: AtomicU64,
}

impl StageMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery taken off the queue.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the disposition a delivery was settled with.
    pub fn record_disposition(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Ack => &self.acked,
            Disposition::Requeue => &self.requeued,
            Disposition::Discard => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler invocation that exceeded the configured timeout.
    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> StageMetricsSnapshot {
        StageMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of stage counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StageMetricsSnapshot {
    /// Deliveries taken off the queue since startup.
    pub received: u64,
    /// Deliveries acknowledged after successful handling.
    pub acked: u64,
    /// Deliveries returned to the queue for another attempt.
    pub requeued: u64,
    /// Deliveries rejected without requeue.
    pub discarded: u64,
    /// Handler invocations cut off by the timeout.
    pub timed_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_each_disposition() {
        let metrics = StageMetrics::new();
        for _ in 0..4 {
            metrics.record_received();
        }
        metrics.record_disposition(Disposition::Ack);
        metrics.record_disposition(Disposition::Ack);
        metrics.record_disposition(Disposition::Requeue);
        metrics.record_disposition(Disposition::Discard);
        metrics.record_timeout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 4);
        assert_eq!(snapshot.acked, 2);
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.discarded, 1);
        assert_eq!(snapshot.timed_out, 1);
    }

    #[test]
    fn snapshot_starts_empty() {
        let snapshot = StageMetrics::new().snapshot();
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.acked + snapshot.requeued + snapshot.discarded, 0);
    }
}
