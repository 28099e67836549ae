//! Application/task repository and the single persisted update path.
//!
//! The poller and the webhook handler race on the same records. Every status
//! update goes through [`apply_report`], which runs the pure transition
//! function inside a version-guarded read-modify-write loop, so a lost
//! update is impossible regardless of delivery order or duplication.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::state_machine::{
    Application, ApplicationStatus, AutomationTask, ReportedStatus, SideEffect, StateMachine,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("no automation task for application {0}")]
    TaskNotFound(String),

    #[error("automation task already exists for application {0}")]
    TaskExists(String),

    #[error("stale version writing {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },

    /// Invariant violation: one external task id may map to exactly one
    /// application. Surfaces as an operator alarm, never silently absorbed.
    #[error("external task id {external_task_id} already mapped to application {existing_application_id}")]
    DuplicateExternalId {
        external_task_id: String,
        existing_application_id: String,
    },

    /// Invariant violation: `external_task_id` is immutable once assigned.
    #[error("external task id of task {task_id} cannot be reassigned")]
    ExternalIdReassigned { task_id: String },
}

impl StoreError {
    /// Invariant violations are fatal and raise operator alarms; everything
    /// else is an expected persistence outcome.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateExternalId { .. } | StoreError::ExternalIdReassigned { .. }
        )
    }
}

/// Persistence seam for applications and their automation tasks.
///
/// `save_*` methods enforce optimistic concurrency: the incoming record's
/// `version` must match the stored one, and a successful save bumps it.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn insert_application(&self, app: Application) -> Result<(), StoreError>;
    async fn application(&self, id: &str) -> Result<Application, StoreError>;
    async fn list_applications(&self) -> Result<Vec<Application>, StoreError>;
    async fn save_application(&self, app: Application) -> Result<Application, StoreError>;

    /// Register a task. At most one task per application; a second insert
    /// fails with [`StoreError::TaskExists`], which is what collapses
    /// concurrent duplicate submissions into one task.
    async fn insert_task(&self, task: AutomationTask) -> Result<(), StoreError>;
    async fn task_for_application(
        &self,
        application_id: &str,
    ) -> Result<Option<AutomationTask>, StoreError>;
    async fn task_by_external_id(
        &self,
        external_task_id: &str,
    ) -> Result<Option<AutomationTask>, StoreError>;
    async fn save_task(&self, task: AutomationTask) -> Result<AutomationTask, StoreError>;

    /// Save both records atomically (both version checks, then both
    /// commits), the equivalent of a single DB transaction.
    async fn save_application_and_task(
        &self,
        app: Application,
        task: AutomationTask,
    ) -> Result<(Application, AutomationTask), StoreError>;
}

/// In-memory store used by the binary and by tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    applications: HashMap<String, Application>,
    /// One task per application, keyed by application id.
    tasks: HashMap<String, AutomationTask>,
    /// external_task_id → application_id unique index.
    external_index: HashMap<String, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn check_external_id(
        &self,
        stored: &AutomationTask,
        incoming: &AutomationTask,
    ) -> Result<Option<String>, StoreError> {
        match (&stored.external_task_id, &incoming.external_task_id) {
            (Some(a), Some(b)) if a != b => Err(StoreError::ExternalIdReassigned {
                task_id: stored.id.clone(),
            }),
            (Some(_), None) => Err(StoreError::ExternalIdReassigned {
                task_id: stored.id.clone(),
            }),
            (None, Some(ext)) => {
                if let Some(existing) = self.external_index.get(ext)
                    && existing != &incoming.application_id
                {
                    return Err(StoreError::DuplicateExternalId {
                        external_task_id: ext.clone(),
                        existing_application_id: existing.clone(),
                    });
                }
                Ok(Some(ext.clone()))
            }
            _ => Ok(None),
        }
    }

    fn save_task(&mut self, mut task: AutomationTask) -> Result<AutomationTask, StoreError> {
        let stored = self
            .tasks
            .get(&task.application_id)
            .ok_or_else(|| StoreError::TaskNotFound(task.application_id.clone()))?;
        if task.version != stored.version {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.clone(),
            });
        }
        let newly_assigned = self.check_external_id(stored, &task)?;
        if let Some(ext) = newly_assigned {
            self.external_index.insert(ext, task.application_id.clone());
        }
        task.version += 1;
        self.tasks.insert(task.application_id.clone(), task.clone());
        Ok(task)
    }

    fn save_application(&mut self, mut app: Application) -> Result<Application, StoreError> {
        let stored = self
            .applications
            .get(&app.id)
            .ok_or_else(|| StoreError::ApplicationNotFound(app.id.clone()))?;
        if app.version != stored.version {
            return Err(StoreError::VersionConflict {
                entity: "application",
                id: app.id.clone(),
            });
        }
        app.version += 1;
        self.applications.insert(app.id.clone(), app.clone());
        Ok(app)
    }
}

#[async_trait]
impl ApplicationStore for InMemoryStore {
    async fn insert_application(&self, app: Application) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.applications.insert(app.id.clone(), app);
        Ok(())
    }

    async fn application(&self, id: &str) -> Result<Application, StoreError> {
        let inner = self.inner.read().await;
        inner
            .applications
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ApplicationNotFound(id.to_string()))
    }

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        let inner = self.inner.read().await;
        let mut apps: Vec<_> = inner.applications.values().cloned().collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }

    async fn save_application(&self, app: Application) -> Result<Application, StoreError> {
        let mut inner = self.inner.write().await;
        inner.save_application(app)
    }

    async fn insert_task(&self, task: AutomationTask) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.application_id) {
            return Err(StoreError::TaskExists(task.application_id.clone()));
        }
        if let Some(ext) = &task.external_task_id {
            if let Some(existing) = inner.external_index.get(ext) {
                return Err(StoreError::DuplicateExternalId {
                    external_task_id: ext.clone(),
                    existing_application_id: existing.clone(),
                });
            }
            inner
                .external_index
                .insert(ext.clone(), task.application_id.clone());
        }
        inner.tasks.insert(task.application_id.clone(), task);
        Ok(())
    }

    async fn task_for_application(
        &self,
        application_id: &str,
    ) -> Result<Option<AutomationTask>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(application_id).cloned())
    }

    async fn task_by_external_id(
        &self,
        external_task_id: &str,
    ) -> Result<Option<AutomationTask>, StoreError> {
        let inner = self.inner.read().await;
        let Some(app_id) = inner.external_index.get(external_task_id) else {
            return Ok(None);
        };
        Ok(inner.tasks.get(app_id).cloned())
    }

    async fn save_task(&self, task: AutomationTask) -> Result<AutomationTask, StoreError> {
        let mut inner = self.inner.write().await;
        inner.save_task(task)
    }

    async fn save_application_and_task(
        &self,
        app: Application,
        task: AutomationTask,
    ) -> Result<(Application, AutomationTask), StoreError> {
        let mut inner = self.inner.write().await;

        // Validate both versions before committing either.
        let stored_app = inner
            .applications
            .get(&app.id)
            .ok_or_else(|| StoreError::ApplicationNotFound(app.id.clone()))?;
        if app.version != stored_app.version {
            return Err(StoreError::VersionConflict {
                entity: "application",
                id: app.id.clone(),
            });
        }
        let stored_task = inner
            .tasks
            .get(&task.application_id)
            .ok_or_else(|| StoreError::TaskNotFound(task.application_id.clone()))?;
        if task.version != stored_task.version {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.clone(),
            });
        }
        inner.check_external_id(stored_task, &task)?;

        let task = inner.save_task(task)?;
        let app = inner.save_application(app)?;
        Ok((app, task))
    }
}

/// Which channel delivered a report. Polls additionally stamp
/// `last_polled_at` on the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    Poll,
    Webhook,
}

/// What a processed report did to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportOutcome {
    pub application_id: String,
    pub status: ApplicationStatus,
    pub changed: bool,
    /// The transition asked for a results fetch (first completion only).
    pub fetch_results: bool,
}

/// Bounded spin on optimistic-concurrency conflicts.
const MAX_CONFLICT_RETRIES: u32 = 8;

/// Apply an engine report to the task identified by `external_task_id`.
///
/// This is the one shared update path for both the poller and the webhook
/// handler. Returns `Ok(None)` when no task is tracked under that id — the
/// engine may legitimately report tasks this instance is not tracking.
pub async fn apply_report(
    store: &dyn ApplicationStore,
    external_task_id: &str,
    reported: ReportedStatus,
    payload: Option<&serde_json::Value>,
    detail: Option<&str>,
    source: ReportSource,
) -> Result<Option<ReportOutcome>, StoreError> {
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some(mut task) = store.task_by_external_id(external_task_id).await? else {
            return Ok(None);
        };
        let mut app = store.application(&task.application_id).await?;

        let outcome = StateMachine::transition(app.status, reported);
        let now = Utc::now();

        for effect in &outcome.effects {
            match effect {
                SideEffect::ArchivePayload => {
                    let archived = payload.cloned().unwrap_or_else(|| {
                        serde_json::json!({
                            "status": reported.to_string(),
                            "message": detail,
                        })
                    });
                    task.archive(archived);
                }
                SideEffect::SetAppliedAt => {
                    if app.applied_at.is_none() {
                        app.applied_at = Some(now);
                    }
                }
                SideEffect::ScheduleResultsFetch => {}
            }
        }

        task.last_known_status = Some(reported);
        if source == ReportSource::Poll {
            task.last_polled_at = Some(now);
        }

        if outcome.changed
            && matches!(
                reported,
                ReportedStatus::Failed | ReportedStatus::Canceled | ReportedStatus::RequiresAttention
            )
        {
            app.status_detail = detail.map(str::to_string);
        }
        app.status = outcome.status;
        app.updated_at = now;

        match store.save_application_and_task(app, task).await {
            Ok((app, _)) => {
                tracing::info!(
                    application_id = %app.id,
                    external_task_id,
                    reported = %reported,
                    status = %app.status,
                    changed = outcome.changed,
                    source = ?source,
                    "engine report applied"
                );
                return Ok(Some(ReportOutcome {
                    application_id: app.id,
                    status: outcome.status,
                    changed: outcome.changed,
                    fetch_results: outcome.effects.contains(&SideEffect::ScheduleResultsFetch),
                }));
            }
            Err(StoreError::VersionConflict { .. }) => continue,
            Err(err) => return Err(err),
        }
    }

    Err(StoreError::VersionConflict {
        entity: "task",
        id: external_task_id.to_string(),
    })
}

/// Merge a fetched results payload into the task's response log.
pub async fn append_task_result(
    store: &dyn ApplicationStore,
    external_task_id: &str,
    payload: serde_json::Value,
) -> Result<(), StoreError> {
    for _ in 0..MAX_CONFLICT_RETRIES {
        let Some(mut task) = store.task_by_external_id(external_task_id).await? else {
            return Ok(());
        };
        task.archive(payload.clone());
        match store.save_task(task).await {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionConflict { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::VersionConflict {
        entity: "task",
        id: external_task_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn tracked_application(store: &InMemoryStore, ext: &str) -> Application {
        let app = Application::new("Backend Engineer", "https://jobs.example.com/42");
        store.insert_application(app.clone()).await.unwrap();
        let mut task = AutomationTask::new(&app.id);
        task.external_task_id = Some(ext.to_string());
        store.insert_task(task).await.unwrap();
        app
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = InMemoryStore::new();
        let app = Application::new("A", "https://a");
        store.insert_application(app.clone()).await.unwrap();

        let fresh = store.save_application(app.clone()).await.unwrap();
        assert_eq!(fresh.version, 1);

        // The original copy is now stale.
        let err = store.save_application(app).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { entity: "application", .. }));
    }

    #[tokio::test]
    async fn second_task_for_same_application_is_rejected() {
        let store = InMemoryStore::new();
        let app = Application::new("A", "https://a");
        store.insert_application(app.clone()).await.unwrap();

        store.insert_task(AutomationTask::new(&app.id)).await.unwrap();
        let err = store.insert_task(AutomationTask::new(&app.id)).await.unwrap_err();
        assert!(matches!(err, StoreError::TaskExists(_)));
    }

    #[tokio::test]
    async fn duplicate_external_id_across_applications_is_an_invariant_violation() {
        let store = InMemoryStore::new();
        tracked_application(&store, "T1").await;

        let other = Application::new("B", "https://b");
        store.insert_application(other.clone()).await.unwrap();
        let mut task = AutomationTask::new(&other.id);
        task.external_task_id = Some("T1".into());

        let err = store.insert_task(task).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExternalId { .. }));
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn external_id_is_immutable_once_assigned() {
        let store = InMemoryStore::new();
        let app = tracked_application(&store, "T1").await;

        let mut task = store.task_for_application(&app.id).await.unwrap().unwrap();
        task.external_task_id = Some("T2".into());
        let err = store.save_task(task).await.unwrap_err();
        assert!(matches!(err, StoreError::ExternalIdReassigned { .. }));
    }

    #[tokio::test]
    async fn report_for_unknown_task_is_a_no_op() {
        let store = InMemoryStore::new();
        let outcome = apply_report(
            &store,
            "ghost",
            ReportedStatus::Completed,
            None,
            None,
            ReportSource::Webhook,
        )
        .await
        .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn completion_report_sets_applied_at_and_requests_fetch() {
        let store = InMemoryStore::new();
        let app = tracked_application(&store, "T1").await;

        let payload = serde_json::json!({"confirmation": "X"});
        let outcome = apply_report(
            &store,
            "T1",
            ReportedStatus::Completed,
            Some(&payload),
            None,
            ReportSource::Webhook,
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome.status, ApplicationStatus::Completed);
        assert!(outcome.changed);
        assert!(outcome.fetch_results);

        let app = store.application(&app.id).await.unwrap();
        assert!(app.applied_at.is_some());
        let task = store.task_by_external_id("T1").await.unwrap().unwrap();
        assert_eq!(task.raw_engine_response.len(), 1);
        assert_eq!(task.last_known_status, Some(ReportedStatus::Completed));
    }

    #[tokio::test]
    async fn duplicate_completion_only_appends_to_the_archive() {
        let store = InMemoryStore::new();
        let app = tracked_application(&store, "T1").await;
        let payload = serde_json::json!({"confirmation": "X"});

        let first = apply_report(&store, "T1", ReportedStatus::Completed, Some(&payload), None, ReportSource::Webhook)
            .await
            .unwrap()
            .unwrap();
        let applied_at = store.application(&app.id).await.unwrap().applied_at;

        let second = apply_report(&store, "T1", ReportedStatus::Completed, Some(&payload), None, ReportSource::Poll)
            .await
            .unwrap()
            .unwrap();

        assert!(first.fetch_results);
        assert!(!second.fetch_results, "no duplicate side effects");
        assert!(!second.changed);
        assert_eq!(store.application(&app.id).await.unwrap().applied_at, applied_at);
        let task = store.task_by_external_id("T1").await.unwrap().unwrap();
        assert_eq!(task.raw_engine_response.len(), 2);
    }

    #[tokio::test]
    async fn dual_channel_race_scenario_resolves_to_completed() {
        // Poller reports running, webhook completes with a confirmation,
        // then a delayed poll reports running again.
        let store = InMemoryStore::new();
        let app = tracked_application(&store, "T1").await;

        apply_report(&store, "T1", ReportedStatus::Running, None, None, ReportSource::Poll)
            .await
            .unwrap();
        let payload = serde_json::json!({"status": "completed", "data": {"confirmation": "X"}});
        apply_report(&store, "T1", ReportedStatus::Completed, Some(&payload), None, ReportSource::Webhook)
            .await
            .unwrap();
        let late = apply_report(&store, "T1", ReportedStatus::Running, None, None, ReportSource::Poll)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(late.status, ApplicationStatus::Completed);
        assert!(!late.changed, "late running report is ignored");

        let app = store.application(&app.id).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::Completed);
        let task = store.task_by_external_id("T1").await.unwrap().unwrap();
        assert!(
            task.raw_engine_response
                .iter()
                .any(|p| p["data"]["confirmation"] == "X"),
            "confirmation is retained"
        );
        assert_eq!(task.raw_engine_response.len(), 3, "late report is archived");
    }

    #[tokio::test]
    async fn concurrent_reports_do_not_lose_updates() {
        let store = Arc::new(InMemoryStore::new());
        tracked_application(&store, "T1").await;

        let payload = serde_json::json!({"confirmation": "X"});
        let a = {
            let store = store.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                apply_report(&*store, "T1", ReportedStatus::Completed, Some(&payload), None, ReportSource::Webhook)
                    .await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                apply_report(&*store, "T1", ReportedStatus::Running, None, None, ReportSource::Poll).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Whichever order the race resolved in, completion wins and both
        // reports made it into the archive.
        let task = store.task_by_external_id("T1").await.unwrap().unwrap();
        assert_eq!(task.raw_engine_response.len(), 2);
        let app = store.application(&task.application_id).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::Completed);
    }

    #[tokio::test]
    async fn failure_report_records_detail() {
        let store = InMemoryStore::new();
        let app = tracked_application(&store, "T1").await;

        apply_report(
            &store,
            "T1",
            ReportedStatus::Failed,
            None,
            Some("form rejected the resume upload"),
            ReportSource::Webhook,
        )
        .await
        .unwrap();

        let app = store.application(&app.id).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::Failed);
        assert_eq!(
            app.status_detail.as_deref(),
            Some("form rejected the resume upload")
        );
    }

    #[tokio::test]
    async fn append_task_result_merges_payload() {
        let store = InMemoryStore::new();
        tracked_application(&store, "T1").await;

        append_task_result(&store, "T1", serde_json::json!({"snapshot": "form"}))
            .await
            .unwrap();
        let task = store.task_by_external_id("T1").await.unwrap().unwrap();
        assert_eq!(task.raw_engine_response.len(), 1);
        assert_eq!(task.raw_engine_response[0]["snapshot"], "form");
    }
}
