//! Background polling of task status.
//!
//! The loop sleeps between attempts; callers that need it off the
//! foreground path spawn [`StatusPoller::run`]. The webhook channel may
//! resolve the application first; the shared transition function makes the
//! two channels safe to race.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::engine::ResilientClient;
use crate::fetcher::ResultsFetcher;
use crate::metrics::Metrics;
use crate::state_machine::ApplicationStatus;
use crate::store::{ApplicationStore, ReportSource, StoreError, apply_report};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Poll attempts before giving up on the polling channel.
    pub max_attempts: u32,
    /// Spacing between polls.
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(300),
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Status is still non-terminal; poll again.
    Continue(ApplicationStatus),
    /// Terminal status reached; polling stops.
    Terminal(ApplicationStatus),
    /// The engine call failed; no state was changed.
    TransportFailed,
    /// No task is tracked under this external id.
    Untracked,
}

pub struct StatusPoller {
    client: Arc<ResilientClient>,
    store: Arc<dyn ApplicationStore>,
    fetcher: Arc<ResultsFetcher>,
    config: PollerConfig,
    metrics: Arc<Metrics>,
}

impl StatusPoller {
    pub fn new(
        client: Arc<ResilientClient>,
        store: Arc<dyn ApplicationStore>,
        fetcher: Arc<ResultsFetcher>,
        config: PollerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            store,
            fetcher,
            config,
            metrics,
        }
    }

    /// Poll until terminal or the attempt budget is exhausted.
    ///
    /// Exhausting the budget is an infrastructure alarm, never an
    /// application-visible failure: the status stays wherever the last
    /// applied report left it and the webhook channel remains live.
    pub async fn run(&self, external_task_id: &str) -> Result<(), StoreError> {
        for attempt in 1..=self.config.max_attempts {
            match self.poll_once(external_task_id).await? {
                PollOutcome::Terminal(status) => {
                    tracing::info!(external_task_id, %status, "polling finished");
                    return Ok(());
                }
                PollOutcome::Untracked => {
                    tracing::warn!(external_task_id, "polled task is not tracked, stopping");
                    return Ok(());
                }
                PollOutcome::Continue(status) => {
                    tracing::debug!(external_task_id, %status, attempt, "task still in progress");
                }
                PollOutcome::TransportFailed => {
                    tracing::debug!(external_task_id, attempt, "poll attempt failed, will retry");
                }
            }
            if attempt < self.config.max_attempts {
                sleep(self.config.interval).await;
            }
        }

        Metrics::incr(&self.metrics.polls_exhausted);
        tracing::error!(
            external_task_id,
            attempts = self.config.max_attempts,
            "poll budget exhausted without a terminal status"
        );
        Ok(())
    }

    /// One poll: query the engine and apply the report.
    ///
    /// Transport failures (including circuit-open rejections) are logged
    /// and retried on the next attempt; they never alter the application
    /// status.
    pub async fn poll_once(&self, external_task_id: &str) -> Result<PollOutcome, StoreError> {
        let status = match self.client.task_status(external_task_id).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(external_task_id, error = %err, "status poll failed");
                return Ok(PollOutcome::TransportFailed);
            }
        };

        let payload = serde_json::json!({
            "status": status.status.to_string(),
            "message": status.message,
        });
        let outcome = apply_report(
            &*self.store,
            external_task_id,
            status.status,
            Some(&payload),
            status.message.as_deref(),
            ReportSource::Poll,
        )
        .await?;

        let Some(outcome) = outcome else {
            return Ok(PollOutcome::Untracked);
        };

        if outcome.fetch_results
            && let Err(err) = self.fetcher.fetch(external_task_id).await
        {
            // Results remain fetchable later; completion already stuck.
            tracing::warn!(external_task_id, error = %err, "results fetch failed");
        }

        if outcome.status.is_terminal() {
            Ok(PollOutcome::Terminal(outcome.status))
        } else {
            Ok(PollOutcome::Continue(outcome.status))
        }
    }
}
