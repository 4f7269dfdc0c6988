//! Error types for chain construction, step logic, start and resume.

use serde_json::Value;
use stepchain_types::error::{RepositoryError, ValidationError};
use thiserror::Error;
use uuid::Uuid;

/// A chain definition is invalid. Raised eagerly by the builder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("step '{step_id}' expects {expected} but the previous step produces {actual}")]
    IncompatibleShapes {
        step_id: String,
        expected: String,
        actual: String,
    },

    #[error("chain '{chain_id}' declares result {expected} but its last step produces {actual}")]
    IncompatibleResult {
        chain_id: String,
        expected: String,
        actual: String,
    },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("with_id('{0}') called before any step was appended")]
    NoStepToRename(String),

    #[error("race step '{0}' has no branches")]
    EmptyRace(String),

    #[error("for-each step '{0}' needs a concurrency of at least 1")]
    InvalidConcurrency(String),
}

/// What a step's own logic returns instead of a value.
///
/// Steps usually build these through `StepContext::suspend` and friends.
#[derive(Debug, Error)]
pub enum StepError {
    /// Pause the execution pending external input.
    #[error("suspended: {reason}")]
    Suspend {
        reason: String,
        payload: Option<Value>,
    },

    /// The step observed the cancel signal and stopped early.
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Failed(err.to_string())
    }
}

impl From<ValidationError> for StepError {
    fn from(err: ValidationError) -> Self {
        StepError::Failed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    InvalidInput(ValidationError),

    #[error("suspension store error: {0}")]
    Store(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("no suspension found for execution {0}")]
    NotFound(Uuid),

    #[error("suspension for execution {0} was already consumed")]
    AlreadyConsumed(Uuid),

    #[error(transparent)]
    InvalidPayload(ValidationError),

    #[error("chain '{0}' is not registered with this runtime")]
    UnknownChain(String),

    #[error("suspension for execution {execution_id} no longer matches its chain: {detail}")]
    StaleRecord { execution_id: Uuid, detail: String },

    #[error("suspension store error: {0}")]
    Store(#[from] RepositoryError),
}
