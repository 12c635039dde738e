use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::experiment::{Experiment, ExperimentId, ExperimentSpec};
use crate::trial::Trial;

use super::{ExperimentStore, StoreConnector};

/// Process-local store. Clones share the same data, which also makes it its
/// own connector.
#[derive(Clone, Debug, Default)]
pub struct InMemoryExperimentStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    experiments: HashMap<ExperimentId, Experiment>,
    by_identity: HashMap<String, ExperimentId>,
    trials: HashMap<ExperimentId, Vec<Trial>>,
    next_trial_id: i64,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiment_count(&self) -> usize {
        self.inner.lock().experiments.len()
    }

    pub fn trial_count(&self, id: ExperimentId) -> usize {
        self.inner.lock().trials.get(&id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ExperimentStore for InMemoryExperimentStore {
    async fn get_experiment(&self, id: ExperimentId) -> anyhow::Result<Option<Experiment>> {
        Ok(self.inner.lock().experiments.get(&id).cloned())
    }

    async fn get_or_create_experiment(
        &self,
        spec: ExperimentSpec,
    ) -> anyhow::Result<(Experiment, bool)> {
        let key = spec.identity_key();
        let mut state = self.inner.lock();
        if let Some(existing) = state
            .by_identity
            .get(&key)
            .and_then(|id| state.experiments.get(id))
        {
            return Ok((existing.clone(), false));
        }
        let experiment = Experiment::from_spec(ExperimentId::new(), spec);
        state.by_identity.insert(key, experiment.id);
        state.experiments.insert(experiment.id, experiment.clone());
        Ok((experiment, true))
    }

    async fn list_trials(&self, id: ExperimentId) -> anyhow::Result<Vec<Trial>> {
        Ok(self.inner.lock().trials.get(&id).cloned().unwrap_or_default())
    }

    async fn append_trial(&self, mut trial: Trial) -> anyhow::Result<Trial> {
        let mut state = self.inner.lock();
        if !state.experiments.contains_key(&trial.experiment_id) {
            anyhow::bail!("experiment {} does not exist", trial.experiment_id);
        }
        state.next_trial_id += 1;
        trial.trial_id = Some(state.next_trial_id);
        state
            .trials
            .entry(trial.experiment_id)
            .or_default()
            .push(trial.clone());
        Ok(trial)
    }
}

#[async_trait]
impl StoreConnector for InMemoryExperimentStore {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ExperimentStore>> {
        Ok(Arc::new(self.clone()))
    }
}
