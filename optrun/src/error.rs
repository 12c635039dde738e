use thiserror::Error;

use crate::experiment::ExperimentId;
use crate::registry::RunId;

/// Errors surfaced by the orchestration core.
///
/// `NotFound`, `Conflict` and `InvalidConfig` are synchronous rejections at
/// submission time. `BackendUnavailable` aborts a submission after its
/// reservation has been rolled back. `RunFailure` and `PersistenceWarning`
/// describe asynchronous outcomes: they are recorded on completion notices and
/// in logs, never returned to the original submitter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("no experiment with id {0}")]
    NotFound(ExperimentId),

    #[error("experiment {experiment_id} is already running")]
    Conflict { experiment_id: ExperimentId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("run {run_id} failed: {message}")]
    RunFailure { run_id: RunId, message: String },

    #[error("trial for experiment {experiment_id} was not persisted: {message}")]
    PersistenceWarning {
        experiment_id: ExperimentId,
        message: String,
    },

    #[error("experiment store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    /// Shorthand for an `InvalidConfig` rejection.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }

    pub(crate) fn backend(err: anyhow::Error) -> Self {
        Self::BackendUnavailable(format!("{err:#}"))
    }
}

/// Misuse of the run registry's reservation protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("experiment {0} has no pending reservation to attach to")]
    NotReserved(ExperimentId),

    #[error("experiment {0} already has a live run attached")]
    AlreadyAttached(ExperimentId),
}
