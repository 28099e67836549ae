use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle statuses of a tracked application.
///
/// Non-terminal flow: PENDING → SUBMITTING → SUBMITTED, with
/// REQUIRES_ATTENTION as a human-in-the-loop side state. Terminal set:
/// COMPLETED, FAILED, CANCELED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Submitting,
    Submitted,
    Completed,
    Failed,
    Canceled,
    RequiresAttention,
}

impl ApplicationStatus {
    /// Terminal statuses absorb all further reports without changing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Completed | ApplicationStatus::Failed | ApplicationStatus::Canceled
        )
    }

    pub const ALL: [ApplicationStatus; 7] = [
        ApplicationStatus::Pending,
        ApplicationStatus::Submitting,
        ApplicationStatus::Submitted,
        ApplicationStatus::Completed,
        ApplicationStatus::Failed,
        ApplicationStatus::Canceled,
        ApplicationStatus::RequiresAttention,
    ];
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationStatus::Pending => write!(f, "PENDING"),
            ApplicationStatus::Submitting => write!(f, "SUBMITTING"),
            ApplicationStatus::Submitted => write!(f, "SUBMITTED"),
            ApplicationStatus::Completed => write!(f, "COMPLETED"),
            ApplicationStatus::Failed => write!(f, "FAILED"),
            ApplicationStatus::Canceled => write!(f, "CANCELED"),
            ApplicationStatus::RequiresAttention => write!(f, "REQUIRES_ATTENTION"),
        }
    }
}

/// A task status as reported by the automation engine, over either the
/// polling or the webhook channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    RequiresAttention,
}

impl ReportedStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReportedStatus::Completed | ReportedStatus::Failed | ReportedStatus::Canceled
        )
    }

    pub const ALL: [ReportedStatus; 6] = [
        ReportedStatus::Pending,
        ReportedStatus::Running,
        ReportedStatus::Completed,
        ReportedStatus::Failed,
        ReportedStatus::Canceled,
        ReportedStatus::RequiresAttention,
    ];
}

impl fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportedStatus::Pending => write!(f, "pending"),
            ReportedStatus::Running => write!(f, "running"),
            ReportedStatus::Completed => write!(f, "completed"),
            ReportedStatus::Failed => write!(f, "failed"),
            ReportedStatus::Canceled => write!(f, "canceled"),
            ReportedStatus::RequiresAttention => write!(f, "requires_attention"),
        }
    }
}

/// Side effects the caller must perform after a transition. The transition
/// function itself performs no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Append the reported payload to the task's response log.
    /// Emitted for every report, including absorbed duplicates.
    ArchivePayload,
    /// Record the completion timestamp if not already set.
    SetAppliedAt,
    /// Enqueue a results fetch for the completed task.
    ScheduleResultsFetch,
}

/// The result of merging a reported status into the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub status: ApplicationStatus,
    /// Whether `status` differs from the previous status.
    pub changed: bool,
    pub effects: Vec<SideEffect>,
}

/// Merges engine-reported statuses into persisted application statuses.
pub struct StateMachine;

impl StateMachine {
    /// Compute the new application status for a reported task status.
    ///
    /// Pure and deterministic over all `(current, reported)` pairs:
    /// - A terminal `current` absorbs every report: the payload is archived
    ///   but the status never changes. This is what makes double delivery
    ///   from both polling and webhooks, and out-of-order delivery, safe.
    /// - Terminal reports (`completed`, `failed`, `canceled`) move a
    ///   non-terminal application to the matching terminal status.
    /// - `requires_attention` parks the application for a human.
    /// - `pending`/`running` set SUBMITTING, except from
    ///   REQUIRES_ATTENTION: a stale progress report must not pull an
    ///   application back out of the human-in-the-loop state.
    pub fn transition(current: ApplicationStatus, reported: ReportedStatus) -> TransitionOutcome {
        if current.is_terminal() {
            return TransitionOutcome {
                status: current,
                changed: false,
                effects: vec![SideEffect::ArchivePayload],
            };
        }

        let (status, mut effects) = match reported {
            ReportedStatus::Completed => (
                ApplicationStatus::Completed,
                vec![SideEffect::SetAppliedAt, SideEffect::ScheduleResultsFetch],
            ),
            ReportedStatus::Failed => (ApplicationStatus::Failed, vec![]),
            ReportedStatus::Canceled => (ApplicationStatus::Canceled, vec![]),
            ReportedStatus::RequiresAttention => (ApplicationStatus::RequiresAttention, vec![]),
            ReportedStatus::Pending | ReportedStatus::Running => {
                if current == ApplicationStatus::RequiresAttention {
                    (ApplicationStatus::RequiresAttention, vec![])
                } else {
                    (ApplicationStatus::Submitting, vec![])
                }
            }
        };

        effects.insert(0, SideEffect::ArchivePayload);
        TransitionOutcome {
            status,
            changed: status != current,
            effects,
        }
    }
}
