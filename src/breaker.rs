//! Circuit breaker guarding an unreliable downstream service.
//!
//! One [`CircuitBreaker`] instance is owned per downstream-service client
//! and shared across concurrent workers; all state lives behind a mutex so
//! the read-decide-write on each call is atomic. A rejected call is a
//! distinguished [`CircuitOpen`] error, not a hard failure — callers requeue
//! rather than alarm.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::metrics::Metrics;

/// The three breaker states: Closed (normal) → Open (reject all) →
/// HalfOpen (probe) → Closed or back to Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Successes required in HalfOpen before the circuit closes again.
    pub half_open_success_threshold: u32,
    /// How long an open circuit rejects calls before allowing a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            half_open_success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Rejection of a call because the circuit is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open, retry in {retry_in_ms}ms")]
pub struct CircuitOpen {
    pub retry_in_ms: u64,
}

/// Either a rejection by the breaker or the wrapped operation's own error.
#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure_at: None,
            }),
            metrics,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Decide whether a call may proceed. An open circuit past its reset
    /// timeout transitions to HalfOpen and admits the probe.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.reset_timeout {
                    self.set_state(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Metrics::incr(&self.metrics.breaker_rejections);
                    let remaining = self.config.reset_timeout.saturating_sub(elapsed);
                    Err(CircuitOpen {
                        retry_in_ms: remaining.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    self.set_state(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                }
            }
            // A success while Open means the caller bypassed try_acquire;
            // leave the window untouched.
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.set_state(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // One failed probe re-opens immediately; the failure counter
                // stays pinned at the threshold.
                inner.consecutive_failures = self.config.failure_threshold;
                self.set_state(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Run `op` under the breaker: rejected without invoking `op` while the
    /// circuit is open, otherwise every `Err` counts as a breaker failure.
    ///
    /// Callers that must not count certain errors as service-health signals
    /// (e.g. HTTP 4xx) use [`try_acquire`](Self::try_acquire) and the
    /// `record_*` primitives directly.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn set_state(&self, inner: &mut BreakerInner, next: BreakerState) {
        if inner.state != next {
            tracing::warn!(breaker = %self.name, from = %inner.state, to = %next, "circuit breaker transition");
            Metrics::incr(&self.metrics.breaker_transitions);
            inner.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn breaker(failure_threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold,
                half_open_success_threshold: 2,
                reset_timeout: Duration::from_millis(reset_ms),
            },
            Metrics::new(),
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) {
        let result: Result<(), _> = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Boom)
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let b = breaker(3, 10_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            fail(&b, &calls).await;
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_invoking_op() {
        let b = breaker(3, 10_000);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            fail(&b, &calls).await;
        }

        // Fourth call inside the reset window never reaches the op.
        let result: Result<(), BreakerError<Boom>> = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn probes_half_open_after_reset_timeout() {
        let b = breaker(1, 20);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await;
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));

        // The next call proceeds as a probe.
        let result: Result<(), BreakerError<Boom>> = b.execute(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn closes_after_half_open_success_threshold() {
        let b = breaker(1, 20);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await;
        std::thread::sleep(Duration::from_millis(30));

        // half_open_success_threshold = 2: one probe success is not enough.
        let _: Result<(), BreakerError<Boom>> = b.execute(|| async { Ok(()) }).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        let _: Result<(), BreakerError<Boom>> = b.execute(|| async { Ok(()) }).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let b = breaker(3, 20);
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail(&b, &calls).await;
        }
        std::thread::sleep(Duration::from_millis(30));

        fail(&b, &calls).await;
        assert_eq!(b.state(), BreakerState::Open);

        // Still rejecting inside the new window.
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_counter() {
        let b = breaker(3, 10_000);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await;
        fail(&b, &calls).await;

        let _: Result<(), BreakerError<Boom>> = b.execute(|| async { Ok(()) }).await;

        // Two more failures are again below the threshold.
        fail(&b, &calls).await;
        fail(&b, &calls).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn rejection_carries_retry_hint() {
        let b = breaker(1, 10_000);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await;

        let err = b.try_acquire().unwrap_err();
        assert!(err.retry_in_ms <= 10_000);
        assert!(err.to_string().contains("circuit open"));
    }

    #[tokio::test]
    async fn transitions_are_counted() {
        let metrics = Metrics::new();
        let b = CircuitBreaker::new(
            "counted",
            BreakerConfig {
                failure_threshold: 1,
                half_open_success_threshold: 1,
                reset_timeout: Duration::from_millis(10),
            },
            metrics.clone(),
        );

        b.record_failure(); // Closed → Open
        std::thread::sleep(Duration::from_millis(20));
        b.try_acquire().unwrap(); // Open → HalfOpen
        b.record_success(); // HalfOpen → Closed

        assert_eq!(metrics.snapshot().breaker_transitions, 3);
    }
}
