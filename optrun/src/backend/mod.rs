//! Worker backends: where a run executor actually executes.
//!
//! Two variants share the [`WorkerBackend`] contract. [`LocalBackend`] runs each
//! executor as a tokio task or as one child process and knows liveness only
//! through completion notices. [`QueueBackend`] enqueues a durable job for a
//! separate worker pool, and the queue's job states are authoritative for
//! liveness. [`Capabilities`] tells callers which guarantees hold.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::completion::CompletionSender;
use crate::experiment::{ExperimentId, ExperimentSnapshot};
use crate::optimizer::OptimizerSpec;
use crate::registry::{RunHandle, RunId, RunStatus};

mod local;
mod process;
mod queue;

pub use local::LocalBackend;
pub use queue::QueueBackend;

/// Everything a worker needs to run one experiment. This is the payload
/// written to a child process's stdin and stored on queue jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunAssignment {
    pub run_id: RunId,
    pub snapshot: ExperimentSnapshot,
    pub optimizer: OptimizerSpec,
}

impl RunAssignment {
    pub fn new(run_id: RunId, snapshot: ExperimentSnapshot, optimizer: OptimizerSpec) -> Self {
        Self {
            run_id,
            snapshot,
            optimizer,
        }
    }

    pub fn experiment_id(&self) -> ExperimentId {
        self.snapshot.id()
    }
}

/// What a backend can promise about its runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `cancel` can interrupt a run that is already executing.
    pub supports_cancel: bool,
    /// `status` and `list_live` reflect an external source of truth rather
    /// than the orchestrator's own registry.
    pub authoritative_liveness: bool,
}

/// Backend view of a run's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub message: Option<String>,
    pub trial_count: Option<u64>,
}

impl RunState {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            message: None,
            trial_count: None,
        }
    }
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start the run executor for `assignment`. Returns once the backend has
    /// accepted the run; never waits for it to finish. The executor's
    /// completion notice is delivered through `completions` when the backend
    /// is in-process, or recorded on the queue otherwise.
    async fn start(
        &self,
        assignment: RunAssignment,
        completions: CompletionSender,
    ) -> anyhow::Result<RunHandle>;

    async fn status(&self, handle: &RunHandle) -> anyhow::Result<RunState>;

    /// Best-effort cancellation. `Ok(false)` means the run could not be
    /// interrupted and is still executing.
    async fn cancel(&self, handle: &RunHandle) -> anyhow::Result<bool>;

    async fn list_live(&self) -> anyhow::Result<Vec<RunHandle>>;

    /// Reflect runs whose worker died without reporting. Returns how many
    /// were marked failed.
    async fn health_check(&self) -> anyhow::Result<u64> {
        Ok(0)
    }

    /// Release whatever the backend holds for live runs when the
    /// orchestrator stops. Returns how many runs were interrupted.
    async fn shutdown(&self) -> anyhow::Result<usize> {
        Ok(0)
    }

    fn capabilities(&self) -> Capabilities;
}
