use thiserror::Error;

use crate::app::BuildError;
use crate::config::ConfigError;
use crate::domain::TaskId;
use crate::store::StoreError;
use crate::typed::RegistryError;

/// Errors surfaced by `Engine` to its caller.
///
/// Handler failures never show up here; they end in the task's state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("background loop failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
