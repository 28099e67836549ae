pub mod client;
pub mod error;
pub mod types;

pub use client::{ClientConfig, ResilientClient};
pub use error::EngineError;
pub use types::{RunTaskRequest, RunTaskResponse, TaskResultsResponse, TaskStatusResponse};
