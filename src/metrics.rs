//! Counters for calls, retries, breaker transitions and submission outcomes.
//!
//! A single [`Metrics`] instance is shared via `Arc` across the client,
//! submitter, poller and webhook handler. [`Metrics::snapshot`] produces a
//! plain copy for the status command and for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub engine_calls: AtomicU64,
    pub engine_retries: AtomicU64,
    pub breaker_transitions: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub submissions_succeeded: AtomicU64,
    pub submissions_failed: AtomicU64,
    pub webhooks_received: AtomicU64,
    pub webhooks_rejected: AtomicU64,
    pub webhooks_unknown_task: AtomicU64,
    pub polls_exhausted: AtomicU64,
    pub results_fetched: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub engine_calls: u64,
    pub engine_retries: u64,
    pub breaker_transitions: u64,
    pub breaker_rejections: u64,
    pub submissions_succeeded: u64,
    pub submissions_failed: u64,
    pub webhooks_received: u64,
    pub webhooks_rejected: u64,
    pub webhooks_unknown_task: u64,
    pub polls_exhausted: u64,
    pub results_fetched: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            engine_calls: self.engine_calls.load(Ordering::Relaxed),
            engine_retries: self.engine_retries.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            submissions_succeeded: self.submissions_succeeded.load(Ordering::Relaxed),
            submissions_failed: self.submissions_failed.load(Ordering::Relaxed),
            webhooks_received: self.webhooks_received.load(Ordering::Relaxed),
            webhooks_rejected: self.webhooks_rejected.load(Ordering::Relaxed),
            webhooks_unknown_task: self.webhooks_unknown_task.load(Ordering::Relaxed),
            polls_exhausted: self.polls_exhausted.load(Ordering::Relaxed),
            results_fetched: self.results_fetched.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.engine_calls);
        Metrics::incr(&metrics.engine_calls);
        Metrics::incr(&metrics.breaker_rejections);

        let snap = metrics.snapshot();
        assert_eq!(snap.engine_calls, 2);
        assert_eq!(snap.breaker_rejections, 1);
        assert_eq!(snap.submissions_failed, 0);
    }

    #[test]
    fn default_snapshot_is_zeroed() {
        assert_eq!(Metrics::new().snapshot(), MetricsSnapshot::default());
    }
}
