use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{ApplicationStatus, ReportedStatus};

/// A job application tracked by the gateway.
///
/// The wider product owns the rest of the application record; this core owns
/// the `status` field and everything derived from engine reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub job_title: String,
    pub job_url: String,
    pub status: ApplicationStatus,
    /// Human-readable detail sourced from the engine's last report,
    /// populated on failure and on requires-attention.
    pub status_detail: Option<String>,
    /// Set the first time a completion report arrives, never overwritten.
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency guard, bumped on every save.
    pub version: u64,
}

impl Application {
    pub fn new(job_title: impl Into<String>, job_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_title: job_title.into(),
            job_url: job_url.into(),
            status: ApplicationStatus::Pending,
            status_detail: None,
            applied_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// The audit record for one engine submission.
///
/// Created when a submission is attempted and never deleted. The engine's
/// responses are appended to `raw_engine_response` in arrival order so the
/// full exchange survives for audit, including duplicate and out-of-order
/// deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTask {
    pub id: String,
    pub application_id: String,
    /// Assigned once the engine accepts the task; immutable afterwards.
    pub external_task_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_known_status: Option<ReportedStatus>,
    /// Append-only log of everything the engine sent back.
    pub raw_engine_response: Vec<serde_json::Value>,
    pub attempt_count: u32,
    /// Optimistic-concurrency guard, bumped on every save.
    pub version: u64,
}

impl AutomationTask {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            application_id: application_id.into(),
            external_task_id: None,
            submitted_at: Utc::now(),
            last_polled_at: None,
            last_known_status: None,
            raw_engine_response: Vec::new(),
            attempt_count: 0,
            version: 0,
        }
    }

    /// Append a payload to the response log.
    pub fn archive(&mut self, payload: serde_json::Value) {
        self.raw_engine_response.push(payload);
    }
}

/// An inbound push notification after signature verification.
///
/// Ephemeral: not persisted beyond processing, except that `payload` is
/// copied into the task's response log.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub external_task_id: String,
    pub reported_status: ReportedStatus,
    pub payload: Option<serde_json::Value>,
    pub error_details: Option<String>,
    pub received_at: DateTime<Utc>,
    pub signature_valid: bool,
}
