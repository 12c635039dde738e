//! Optrun - at-most-once orchestration of long-running optimization runs.
//!
//! An experiment is a tool command template plus bounded numeric parameters.
//! A run of an experiment drives an optimizer (grid or Bayesian) that
//! proposes configurations, scores each by executing the rendered command,
//! and appends every scored configuration to the experiment's trial history.
//!
//! # Core Concepts
//!
//! - **Orchestrator**: [`Orchestrator`] is the request surface: create or
//!   fetch experiments, submit and stop runs, list live runs and trials.
//!
//! - **Registry**: [`RunRegistry`] holds at most one live run per
//!   experiment. Submissions reserve a slot before anything is started, so
//!   concurrent submits for the same experiment start exactly one run.
//!
//! - **Backends**: the [`WorkerBackend`] trait abstracts where runs execute.
//!   [`LocalBackend`] runs them as tasks or child processes;
//!   [`QueueBackend`] enqueues them on a durable [`JobQueue`] drained by a
//!   [`QueueWorkerPool`].
//!
//! - **Completion**: every run ends by sending a [`CompletionNotice`]; the
//!   [`Reconciler`] folds notices (and, for authoritative backends, backend
//!   status) back into the registry.
//!
//! - **Store**: [`ExperimentStore`] persists experiments and their
//!   append-only trial history. Run executors open their own session
//!   through a [`StoreConnector`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store and job queue via sqlx, plus the
//!   `optrun-worker` binary
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use optrun::*;
//!
//! let store = Arc::new(InMemoryExperimentStore::new());
//! let backend = Arc::new(LocalBackend::in_process(store.clone(), Arc::new(CommandEvaluator::new())));
//! let orchestrator = Orchestrator::builder()
//!     .with_store(store)
//!     .with_backend(backend)
//!     .build()?;
//!
//! let (experiment, _) = orchestrator.create_or_get_experiment(spec).await?;
//! let response = orchestrator.submit_run(experiment.id, None).await?;
//! ```

/// Worker backends that execute runs.
///
/// [`WorkerBackend`] is implemented by [`LocalBackend`] (in-process tasks or
/// child processes) and [`QueueBackend`] (durable job queue).
pub mod backend;

/// Completion notices and the channel runs report them on.
pub mod completion;

/// Configuration for backends, persistence, queue and workers.
///
/// [`OrchestratorConfig::from_env`] reads the `OPTRUN_*` variables and
/// `DATABASE_URL`.
pub mod config;

/// Turns run requests into started runs.
pub mod dispatcher;

/// Error taxonomy shared by every request path.
pub mod error;

/// Run lifecycle events and the in-process bus that broadcasts them.
pub mod events;

/// The run executor and the trial evaluators it drives.
pub mod executor;

/// Experiments, their parameters and the snapshot handed to workers.
pub mod experiment;

#[cfg(feature = "metrics")]
/// Prometheus metrics for runs, trials and leases.
pub mod metrics;

/// Grid and Bayesian optimizers.
pub mod optimizer;

/// The request surface tying store, registry and backend together.
pub mod orchestrator;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed implementations of
/// the experiment store and the job queue when the `postgres` feature is
/// enabled.
pub mod persistence;

/// Durable run queue contract and its in-memory implementation.
pub mod queue;

/// Folds completion notices and backend status into the registry.
pub mod reconciler;

/// Live-run bookkeeping: at most one run per experiment.
pub mod registry;

/// Queue worker pool: workers, lease renewal and the housekeeper.
///
/// - [`QueueWorkerPool`] - drains a [`JobQueue`] with N workers
/// - [`QueueWorkerPoolBuilder`] - explicit dependency wiring
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`WorkerConfig`] - polling and renewal tuning
pub mod runtime;

/// Experiment and trial persistence contract.
pub mod store;

/// Tracing spans and `record_*` helpers.
pub mod telemetry;

/// Trials and the configurations they score.
pub mod trial;

pub use backend::{
    Capabilities, LocalBackend, QueueBackend, RunAssignment, RunState, WorkerBackend,
};
pub use completion::{
    completion_channel, CompletionNotice, CompletionReceiver, CompletionSender, TerminalStatus,
};
pub use config::{BackendConfig, LaunchMode, OrchestratorConfig, PersistenceConfig, QueueConfig};
pub use dispatcher::{Dispatcher, RunRequest};
pub use error::{OrchestratorError, RegistryError};
pub use events::{RunEvent, RunEventBus, RunEventPayload, RunEventStream};
pub use executor::{CommandEvaluator, RunExecutor, RunPhase, TrialEvaluator};
pub use experiment::{
    Compute, Experiment, ExperimentId, ExperimentSnapshot, ExperimentSpec, Parameter,
};
pub use optimizer::{Optimizer, OptimizerSpec};
pub use orchestrator::{
    ExperimentStatusView, Orchestrator, OrchestratorBuilder, StopResponse, SubmitResponse,
    SubmitStatus,
};
pub use queue::{
    InMemoryJobQueue, JobId, JobLease, JobQueue, JobRecord, JobState, LeaseExpiryScanner,
    LeaseId, LeaseRenewal,
};
pub use reconciler::{ReconcileReport, Reconciler};
pub use registry::{BackendRef, RunHandle, RunId, RunRegistry, RunStatus};
pub use runtime::{QueueWorkerPool, QueueWorkerPoolBuilder, ShutdownToken, WorkerConfig};
pub use store::{ExperimentStore, InMemoryExperimentStore, StoreConnector};
pub use trial::{Configuration, ParameterValue, Trial};
