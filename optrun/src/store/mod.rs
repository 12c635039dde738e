//! Durable store contract for experiments and trials.
//!
//! The orchestrator never owns schema or transactions; it reads and writes
//! through [`ExperimentStore`]. Run executors obtain their own store session
//! through a [`StoreConnector`] so no handle is shared across process or
//! worker boundaries.

use std::sync::Arc;

use async_trait::async_trait;

use crate::experiment::{Experiment, ExperimentId, ExperimentSpec};
use crate::trial::Trial;

mod memory;

pub use memory::InMemoryExperimentStore;

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Fetch an experiment by id.
    async fn get_experiment(&self, id: ExperimentId) -> anyhow::Result<Option<Experiment>>;

    /// Return the experiment matching the spec's identity, creating it if
    /// needed. The flag is `true` when a new experiment was created.
    async fn get_or_create_experiment(
        &self,
        spec: ExperimentSpec,
    ) -> anyhow::Result<(Experiment, bool)>;

    /// All trials of an experiment in insertion order.
    async fn list_trials(&self, id: ExperimentId) -> anyhow::Result<Vec<Trial>>;

    /// Append a trial, returning it with its store-assigned id.
    async fn append_trial(&self, trial: Trial) -> anyhow::Result<Trial>;
}

/// Opens store sessions for run executors.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ExperimentStore>>;
}
