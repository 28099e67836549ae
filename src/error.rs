use thiserror::Error;

use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApplyflowError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Profile error: {0}")]
    Profile(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ApplyflowError {
    /// Rejections by an open circuit are requeue signals, not alarms.
    pub fn is_requeue(&self) -> bool {
        matches!(self, ApplyflowError::Engine(EngineError::CircuitOpen { .. }))
    }
}
