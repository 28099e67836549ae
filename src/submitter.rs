//! Submission of applications to the automation engine.
//!
//! The submitter builds the run-task request from the application and the
//! applicant profile, claims the application (Pending → Submitting) under
//! the optimistic-concurrency guard so concurrent duplicate attempts
//! collapse, and registers the returned external task id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, ResilientClient, RunTaskRequest};
use crate::error::ApplyflowError;
use crate::metrics::Metrics;
use crate::state_machine::{Application, ApplicationStatus, AutomationTask};
use crate::store::{ApplicationStore, StoreError};

/// Applicant data resolved for one submission. Opaque to the engine beyond
/// being valid JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionInputs {
    pub full_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Engine-ready resume descriptor (URL or inline document).
    pub resume: serde_json::Value,
    /// Free-form answers to screening questions.
    #[serde(default)]
    pub answers: serde_json::Value,
}

/// Resolves contact data and documents for an application.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn submission_inputs(
        &self,
        application: &Application,
    ) -> anyhow::Result<SubmissionInputs>;
}

/// Provider backed by one fixed profile, as configured for the CLI binary.
pub struct StaticProfileProvider {
    inputs: SubmissionInputs,
}

impl StaticProfileProvider {
    pub fn new(inputs: SubmissionInputs) -> Self {
        Self { inputs }
    }
}

#[async_trait]
impl ProfileProvider for StaticProfileProvider {
    async fn submission_inputs(
        &self,
        _application: &Application,
    ) -> anyhow::Result<SubmissionInputs> {
        Ok(self.inputs.clone())
    }
}

/// The result of a submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The engine accepted the task.
    Submitted { external_task_id: String },
    /// A task already exists (or another worker holds the claim); nothing
    /// was sent. `external_task_id` is `None` while the other attempt is
    /// still in flight.
    AlreadySubmitted { external_task_id: Option<String> },
    /// The engine rejected the submission; the application is Failed with
    /// the detail archived.
    Failed { detail: String },
}

pub struct Submitter {
    client: Arc<ResilientClient>,
    store: Arc<dyn ApplicationStore>,
    profiles: Arc<dyn ProfileProvider>,
    /// Public URL the engine should push webhooks to, if any.
    webhook_url: Option<String>,
    max_duration_seconds: u64,
    metrics: Arc<Metrics>,
}

/// Bounded spin on optimistic-concurrency conflicts while finalizing.
const MAX_CONFLICT_RETRIES: u32 = 8;

impl Submitter {
    pub fn new(
        client: Arc<ResilientClient>,
        store: Arc<dyn ApplicationStore>,
        profiles: Arc<dyn ProfileProvider>,
        webhook_url: Option<String>,
        max_duration_seconds: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            store,
            profiles,
            webhook_url,
            max_duration_seconds,
            metrics,
        }
    }

    /// Submit an application to the engine.
    ///
    /// Idempotent: a task with an assigned external id short-circuits, and
    /// the Pending → Submitting claim is a version-guarded save, so of any
    /// number of concurrent attempts exactly one reaches the engine.
    ///
    /// A circuit-open rejection releases the claim and propagates as an
    /// error so the caller can requeue; no status change is recorded.
    ///
    /// Known gap: if the engine accepts the task but the response is lost,
    /// a retried submission creates a second engine task — the engine
    /// offers no idempotency key. The unique external-id index makes the
    /// collision loud instead of silent.
    pub async fn submit(&self, application_id: &str) -> Result<SubmitOutcome, ApplyflowError> {
        let app = self.store.application(application_id).await?;

        if let Some(task) = self.store.task_for_application(application_id).await?
            && let Some(ext) = task.external_task_id
        {
            tracing::info!(application_id, external_task_id = %ext, "submission already registered");
            return Ok(SubmitOutcome::AlreadySubmitted {
                external_task_id: Some(ext),
            });
        }

        match app.status {
            ApplicationStatus::Pending => {}
            // Another worker already claimed it; its task registration may
            // still be in flight.
            ApplicationStatus::Submitting | ApplicationStatus::Submitted => {
                return Ok(SubmitOutcome::AlreadySubmitted {
                    external_task_id: None,
                });
            }
            other => {
                return Err(ApplyflowError::InvalidState(format!(
                    "application {application_id} is {other}, expected PENDING"
                )));
            }
        }

        // Claim the application; the version guard makes this the exclusion
        // point for concurrent duplicate attempts.
        let mut claimed = app.clone();
        claimed.status = ApplicationStatus::Submitting;
        claimed.updated_at = Utc::now();
        match self.store.save_application(claimed).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                tracing::info!(application_id, "another worker holds the submission claim");
                return Ok(SubmitOutcome::AlreadySubmitted {
                    external_task_id: None,
                });
            }
            Err(err) => return Err(err.into()),
        }

        // Register the audit-trail task if a previous attempt didn't.
        match self.store.insert_task(AutomationTask::new(application_id)).await {
            Ok(()) | Err(StoreError::TaskExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let inputs = self
            .profiles
            .submission_inputs(&app)
            .await
            .map_err(ApplyflowError::Profile)?;
        let request = RunTaskRequest {
            prompt: build_prompt(&app),
            inputs: serde_json::to_value(&inputs)?,
            webhook_url: self.webhook_url.clone(),
            max_duration_seconds: self.max_duration_seconds,
        };

        match self.client.run_task(&request).await {
            Ok(resp) => {
                self.finalize_submission(application_id, &resp.task_id).await?;
                Metrics::incr(&self.metrics.submissions_succeeded);
                tracing::info!(application_id, external_task_id = %resp.task_id, "task submitted");
                Ok(SubmitOutcome::Submitted {
                    external_task_id: resp.task_id,
                })
            }
            Err(EngineError::CircuitOpen { retry_in_ms }) => {
                self.release_claim(application_id).await?;
                tracing::info!(application_id, retry_in_ms, "circuit open, submission requeued");
                Err(EngineError::CircuitOpen { retry_in_ms }.into())
            }
            Err(err) => {
                let detail = err.to_string();
                self.mark_submission_failed(application_id, &detail).await?;
                Metrics::incr(&self.metrics.submissions_failed);
                tracing::warn!(application_id, error = %detail, "submission failed");
                Ok(SubmitOutcome::Failed { detail })
            }
        }
    }

    /// Move a parked application back to Submitting after a human resolved
    /// whatever the engine flagged. The engine task keeps running under the
    /// same external id; callers reschedule polling afterwards.
    pub async fn resume(&self, application_id: &str) -> Result<(), ApplyflowError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut app = self.store.application(application_id).await?;
            if app.status != ApplicationStatus::RequiresAttention {
                return Err(ApplyflowError::InvalidState(format!(
                    "application {application_id} is {}, expected REQUIRES_ATTENTION",
                    app.status
                )));
            }
            let mut task = self
                .store
                .task_for_application(application_id)
                .await?
                .ok_or_else(|| StoreError::TaskNotFound(application_id.to_string()))?;
            task.archive(serde_json::json!({"event": "resumed_by_operator"}));
            app.status = ApplicationStatus::Submitting;
            app.status_detail = None;
            app.updated_at = Utc::now();
            match self.store.save_application_and_task(app, task).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::VersionConflict {
            entity: "application",
            id: application_id.to_string(),
        }
        .into())
    }

    /// Withdraw an application at the user's request.
    ///
    /// Takes effect immediately: the application is Canceled without asking
    /// the engine, and any report that arrives afterwards is absorbed by
    /// the terminal-status merge rule. Withdrawing twice is a no-op.
    pub async fn cancel(&self, application_id: &str) -> Result<(), ApplyflowError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut app = self.store.application(application_id).await?;
            if app.status == ApplicationStatus::Canceled {
                return Ok(());
            }
            if app.status.is_terminal() {
                return Err(ApplyflowError::InvalidState(format!(
                    "application {application_id} is {}, cannot withdraw",
                    app.status
                )));
            }
            app.status = ApplicationStatus::Canceled;
            app.status_detail = Some("canceled by user".to_string());
            app.updated_at = Utc::now();
            // Before the first submission attempt there is no task record.
            let result = match self.store.task_for_application(application_id).await? {
                Some(mut task) => {
                    task.archive(serde_json::json!({"event": "canceled_by_user"}));
                    self.store.save_application_and_task(app, task).await.map(|_| ())
                }
                None => self.store.save_application(app).await.map(|_| ()),
            };
            match result {
                Ok(()) => {
                    tracing::info!(application_id, "application withdrawn by user");
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::VersionConflict {
            entity: "application",
            id: application_id.to_string(),
        }
        .into())
    }

    async fn finalize_submission(
        &self,
        application_id: &str,
        external_task_id: &str,
    ) -> Result<(), ApplyflowError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut task = self
                .store
                .task_for_application(application_id)
                .await?
                .ok_or_else(|| StoreError::TaskNotFound(application_id.to_string()))?;
            task.external_task_id = Some(external_task_id.to_string());
            task.attempt_count += 1;
            task.submitted_at = Utc::now();
            match self.store.save_task(task).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::VersionConflict {
            entity: "task",
            id: application_id.to_string(),
        }
        .into())
    }

    async fn release_claim(&self, application_id: &str) -> Result<(), ApplyflowError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut app = self.store.application(application_id).await?;
            app.status = ApplicationStatus::Pending;
            app.updated_at = Utc::now();
            match self.store.save_application(app).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::VersionConflict {
            entity: "application",
            id: application_id.to_string(),
        }
        .into())
    }

    async fn mark_submission_failed(
        &self,
        application_id: &str,
        detail: &str,
    ) -> Result<(), ApplyflowError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut app = self.store.application(application_id).await?;
            let mut task = self
                .store
                .task_for_application(application_id)
                .await?
                .ok_or_else(|| StoreError::TaskNotFound(application_id.to_string()))?;
            task.archive(serde_json::json!({"error": detail}));
            app.status = ApplicationStatus::Failed;
            app.status_detail = Some(detail.to_string());
            app.updated_at = Utc::now();
            match self.store.save_application_and_task(app, task).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::VersionConflict {
            entity: "application",
            id: application_id.to_string(),
        }
        .into())
    }
}

fn build_prompt(app: &Application) -> String {
    format!(
        "Apply to the job posting \"{}\" at {} on behalf of the applicant described in the inputs. \
         Fill every required field, attach the resume, and submit the application.",
        app.job_title, app.job_url
    )
}
