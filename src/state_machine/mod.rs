mod status;
mod task;

pub use status::{ApplicationStatus, ReportedStatus, SideEffect, StateMachine, TransitionOutcome};
pub use task::{Application, AutomationTask, WebhookEvent};
