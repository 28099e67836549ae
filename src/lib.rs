//! applyflow — resilient gateway between job applications and a
//! browser-automation engine.
//!
//! The engine applies to postings on external job boards and reports back
//! over two racing channels: status polling and signed webhooks. This crate
//! owns the application status lifecycle, the circuit-broken HTTP client,
//! and the reconciliation of both channels through one pure transition
//! function.

pub mod breaker;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod poller;
pub mod state_machine;
pub mod store;
pub mod submitter;
pub mod ui;
pub mod webhook;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::ApplyflowConfig;
pub use engine::{ClientConfig, EngineError, ResilientClient};
pub use error::ApplyflowError;
pub use fetcher::ResultsFetcher;
pub use metrics::Metrics;
pub use poller::{PollerConfig, StatusPoller};
pub use state_machine::{
    Application, ApplicationStatus, AutomationTask, ReportedStatus, StateMachine,
};
pub use store::{ApplicationStore, InMemoryStore, StoreError};
pub use submitter::{SubmitOutcome, Submitter};
