//! The orchestrator: one explicitly constructed value holding the registry,
//! the store and the backend, shared by reference with request handlers.

use std::any::type_name;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Capabilities, WorkerBackend};
use crate::completion::completion_channel;
use crate::dispatcher::{Dispatcher, RunRequest};
use crate::error::OrchestratorError;
use crate::events::{RunEvent, RunEventBus, RunEventPayload};
use crate::experiment::{Experiment, ExperimentId, ExperimentSpec};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::{RunHandle, RunRegistry, RunStatus};
use crate::store::ExperimentStore;
use crate::trial::Trial;

/// Outcome of [`Orchestrator::submit_run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Submitted,
    AlreadyRunning,
    InvalidConfig,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<RunHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmitResponse {
    fn submitted(handle: RunHandle) -> Self {
        Self {
            status: SubmitStatus::Submitted,
            handle: Some(handle),
            message: None,
        }
    }

    fn rejected(status: SubmitStatus, err: &OrchestratorError) -> Self {
        Self {
            status,
            handle: None,
            message: Some(err.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub message: String,
}

/// An experiment plus whether a run of it is live right now.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatusView {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub running: bool,
}

pub struct Orchestrator {
    store: Arc<dyn ExperimentStore>,
    backend: Arc<dyn WorkerBackend>,
    registry: Arc<RunRegistry>,
    reconciler: Arc<Reconciler>,
    dispatcher: Dispatcher,
    events: Option<RunEventBus>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("capabilities", &self.backend.capabilities())
            .field("live_runs", &self.registry.live_count())
            .field("events", &self.events)
            .finish()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    fn new(
        store: Arc<dyn ExperimentStore>,
        backend: Arc<dyn WorkerBackend>,
        events: Option<RunEventBus>,
    ) -> Self {
        let registry = Arc::new(RunRegistry::new());
        let (completions, receiver) = completion_channel();
        let reconciler = Arc::new(Reconciler::new(
            receiver,
            Arc::clone(&registry),
            Arc::clone(&backend),
            events.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&backend),
            completions,
            Arc::clone(&reconciler),
            events.clone(),
        );
        Self {
            store,
            backend,
            registry,
            reconciler,
            dispatcher,
            events,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn events(&self) -> Option<RunEventBus> {
        self.events.clone()
    }

    /// Return the experiment matching `spec`, creating it first if needed.
    /// The flag is `true` when it was created by this call.
    pub async fn create_or_get_experiment(
        &self,
        spec: ExperimentSpec,
    ) -> Result<(Experiment, bool), OrchestratorError> {
        spec.validate()?;
        let (experiment, created) = self
            .store
            .get_or_create_experiment(spec)
            .await
            .map_err(OrchestratorError::store)?;
        if created {
            tracing::info!(experiment_id = %experiment.id, tool = %experiment.tool_name, "experiment created");
        }
        Ok((experiment, created))
    }

    pub async fn get_experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<ExperimentStatusView, OrchestratorError> {
        self.reconciler.reconcile().await;
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await
            .map_err(OrchestratorError::store)?
            .ok_or(OrchestratorError::NotFound(experiment_id))?;
        Ok(ExperimentStatusView {
            running: self.registry.get(experiment_id).is_some(),
            experiment,
        })
    }

    /// Submit one run. Rejections the caller can act on are reported in the
    /// response; store and backend faults are errors.
    pub async fn submit_run(
        &self,
        experiment_id: ExperimentId,
        optimizer: Option<Value>,
    ) -> Result<SubmitResponse, OrchestratorError> {
        let request = RunRequest {
            experiment_id,
            optimizer,
        };
        match self.dispatcher.submit(request).await {
            Ok(handle) => Ok(SubmitResponse::submitted(handle)),
            Err(err @ OrchestratorError::Conflict { .. }) => {
                Ok(SubmitResponse::rejected(SubmitStatus::AlreadyRunning, &err))
            }
            Err(err @ OrchestratorError::InvalidConfig(_)) => {
                Ok(SubmitResponse::rejected(SubmitStatus::InvalidConfig, &err))
            }
            Err(err @ OrchestratorError::NotFound(_)) => {
                Ok(SubmitResponse::rejected(SubmitStatus::NotFound, &err))
            }
            Err(err) => Err(err),
        }
    }

    /// Live runs as of this call. Authoritative backends are asked directly,
    /// so runs started by other orchestrators sharing the queue are listed
    /// too.
    pub async fn list_live_runs(&self) -> Result<Vec<RunHandle>, OrchestratorError> {
        self.reconciler.reconcile().await;
        if self.backend.capabilities().authoritative_liveness {
            return self
                .backend
                .list_live()
                .await
                .map_err(OrchestratorError::backend);
        }
        Ok(self.registry.list())
    }

    /// The live run of the experiment, else its most recent terminal run.
    pub async fn get_run_status(&self, experiment_id: ExperimentId) -> Option<RunHandle> {
        self.reconciler.reconcile().await;
        self.registry
            .get(experiment_id)
            .or_else(|| self.registry.last_terminal(experiment_id))
    }

    /// Cancel the experiment's live run. Never fails; the response says what
    /// happened.
    pub async fn stop_run(&self, experiment_id: ExperimentId) -> StopResponse {
        self.reconciler.reconcile().await;
        let Some(handle) = self.registry.get(experiment_id) else {
            return StopResponse {
                stopped: false,
                message: format!("experiment {experiment_id} not already running"),
            };
        };

        match self.backend.cancel(&handle).await {
            Ok(true) => {
                let message = format!("stopped running experiment {experiment_id}");
                // A stopped queue job never reaches a worker, so no notice follows.
                let expects_notice = !self.backend.capabilities().authoritative_liveness;
                if self
                    .registry
                    .retire(&handle, RunStatus::Cancelled, message.clone(), expects_notice)
                    .is_none()
                {
                    tracing::debug!(
                        run_id = %handle.run_id,
                        %experiment_id,
                        "stopped run was reconciled before it could be retired"
                    );
                }
                tracing::info!(run_id = %handle.run_id, %experiment_id, "run stopped");
                if let Some(events) = &self.events {
                    events.publish(RunEvent::for_run(
                        experiment_id,
                        handle.run_id,
                        RunEventPayload::Stopped {
                            run_id: handle.run_id,
                            message: message.clone(),
                        },
                    ));
                }
                StopResponse {
                    stopped: true,
                    message,
                }
            }
            Ok(false) => {
                // The run may have ended while the backend was asked.
                self.reconciler.reconcile().await;
                let still_live = self
                    .registry
                    .get(experiment_id)
                    .is_some_and(|live| live.run_id == handle.run_id);
                if !still_live {
                    return StopResponse {
                        stopped: false,
                        message: format!("experiment {experiment_id} not already running"),
                    };
                }
                tracing::warn!(run_id = %handle.run_id, %experiment_id, "stop request refused by backend");
                StopResponse {
                    stopped: false,
                    message: format!(
                        "experiment {experiment_id} is already executing and its backend cannot interrupt it"
                    ),
                }
            }
            Err(err) => {
                tracing::warn!(run_id = %handle.run_id, %experiment_id, error = %err, "stop request failed");
                StopResponse {
                    stopped: false,
                    message: format!("could not stop experiment {experiment_id}: {err:#}"),
                }
            }
        }
    }

    pub async fn list_trials(&self, experiment_id: ExperimentId) -> Result<Vec<Trial>, OrchestratorError> {
        self.store
            .list_trials(experiment_id)
            .await
            .map_err(OrchestratorError::store)
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler.reconcile().await
    }

    /// Interrupt whatever the backend still runs for this orchestrator.
    /// Returns how many runs were cancelled.
    pub async fn shutdown(&self) -> Result<usize, OrchestratorError> {
        tracing::info!("Initiating orchestrator shutdown");
        let cancelled = self
            .backend
            .shutdown()
            .await
            .map_err(OrchestratorError::backend)?;
        tracing::info!(cancelled, "Orchestrator shutdown complete");
        Ok(cancelled)
    }
}

/// Builder for an [`Orchestrator`]. Store and backend are required; the event
/// bus is optional.
#[derive(Default)]
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn ExperimentStore>>,
    backend: Option<Arc<dyn WorkerBackend>>,
    events: Option<RunEventBus>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("store_set", &self.store.is_some())
            .field("backend_set", &self.backend.is_some())
            .field("events", &self.events)
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ExperimentStore + 'static,
    {
        tracing::debug!(store = type_name::<S>(), "orchestrator store configured");
        self.store = Some(store);
        self
    }

    pub fn with_backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: WorkerBackend + 'static,
    {
        tracing::debug!(backend = type_name::<B>(), "orchestrator backend configured");
        self.backend = Some(backend);
        self
    }

    /// Same as [`Self::with_backend`] for an already type-erased backend.
    pub fn with_dyn_backend(mut self, backend: Arc<dyn WorkerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_dyn_store(mut self, store: Arc<dyn ExperimentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: RunEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let store = self
            .store
            .ok_or_else(|| anyhow!("store dependency missing"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow!("backend dependency missing"))?;
        Ok(Orchestrator::new(store, backend, self.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::executor::TrialEvaluator;
    use crate::experiment::{Compute, ExperimentSnapshot, Parameter};
    use crate::store::InMemoryExperimentStore;
    use crate::trial::Configuration;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Blocks every evaluation until the test opens the gate.
    struct Gate(Arc<Semaphore>);

    #[async_trait]
    impl TrialEvaluator for Gate {
        async fn evaluate(&self, _: &ExperimentSnapshot, configuration: &Configuration) -> anyhow::Result<f64> {
            let permit = self.0.acquire().await?;
            permit.forget();
            Ok(configuration.values().sum())
        }
    }

    fn spec() -> ExperimentSpec {
        ExperimentSpec {
            tool_name: "scenario".into(),
            parameters: vec![Parameter::new("a", 0.0, 1.0).unwrap()],
            command_template_string: "run ${a}".into(),
            compute: Compute::default(),
        }
    }

    fn orchestrator() -> (Orchestrator, Arc<Semaphore>, RunEventBus) {
        let store = Arc::new(InMemoryExperimentStore::new());
        let gate = Arc::new(Semaphore::new(0));
        let backend = Arc::new(LocalBackend::in_process(
            store.clone(),
            Arc::new(Gate(Arc::clone(&gate))),
        ));
        let events = RunEventBus::new(32);
        let orchestrator = Orchestrator::builder()
            .with_store(store)
            .with_backend(backend)
            .with_events(events.clone())
            .build()
            .unwrap();
        (orchestrator, gate, events)
    }

    async fn wait_terminal(orchestrator: &Orchestrator, id: ExperimentId) -> RunHandle {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(handle) = orchestrator.get_run_status(id).await {
                    if handle.status.is_terminal() {
                        return handle;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run did not finish")
    }

    #[tokio::test]
    async fn builder_requires_store_and_backend() {
        let err = OrchestratorBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("store dependency missing"));
        let err = OrchestratorBuilder::new()
            .with_store(Arc::new(InMemoryExperimentStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("backend dependency missing"));
    }

    #[tokio::test]
    async fn create_or_get_is_idempotent_and_validates() {
        let (orchestrator, _, _) = orchestrator();
        let (first, created) = orchestrator.create_or_get_experiment(spec()).await.unwrap();
        assert!(created);
        let (second, created) = orchestrator.create_or_get_experiment(spec()).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let mut bad = spec();
        bad.parameters.push(Parameter {
            name: "b".into(),
            minimum: 2.0,
            maximum: 1.0,
        });
        let err = orchestrator.create_or_get_experiment(bad).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn default_run_scenario() {
        let (orchestrator, gate, events) = orchestrator();
        let mut rx = events.subscribe();
        let (experiment, _) = orchestrator.create_or_get_experiment(spec()).await.unwrap();

        let first = orchestrator.submit_run(experiment.id, None).await.unwrap();
        assert_eq!(first.status, SubmitStatus::Submitted);
        let second = orchestrator.submit_run(experiment.id, None).await.unwrap();
        assert_eq!(second.status, SubmitStatus::AlreadyRunning);
        assert!(orchestrator.get_experiment(experiment.id).await.unwrap().running);
        assert_eq!(orchestrator.list_live_runs().await.unwrap().len(), 1);

        gate.add_permits(64);
        let terminal = wait_terminal(&orchestrator, experiment.id).await;
        assert_eq!(terminal.status, RunStatus::Finished);
        assert_eq!(terminal.trial_count, Some(4));

        assert_eq!(orchestrator.list_trials(experiment.id).await.unwrap().len(), 4);
        assert!(orchestrator.list_live_runs().await.unwrap().is_empty());
        assert!(!orchestrator.get_experiment(experiment.id).await.unwrap().running);

        assert!(matches!(
            rx.recv().await.unwrap().payload,
            RunEventPayload::Submitted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().payload,
            RunEventPayload::Completed {
                status: RunStatus::Finished,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rejections_are_responses_not_errors() {
        let (orchestrator, _, _) = orchestrator();
        let missing = orchestrator
            .submit_run(ExperimentId::new(), None)
            .await
            .unwrap();
        assert_eq!(missing.status, SubmitStatus::NotFound);
        assert!(missing.handle.is_none());

        let (experiment, _) = orchestrator.create_or_get_experiment(spec()).await.unwrap();
        let invalid = orchestrator
            .submit_run(experiment.id, Some(json!({"type": "grid", "num_configs_per_param": 0})))
            .await
            .unwrap();
        assert_eq!(invalid.status, SubmitStatus::InvalidConfig);
        assert!(invalid.message.is_some());
        assert!(orchestrator.get_run_status(experiment.id).await.is_none());
    }

    #[tokio::test]
    async fn stop_run_cancels_and_reports() {
        let (orchestrator, _gate, events) = orchestrator();
        let mut rx = events.subscribe();
        let (experiment, _) = orchestrator.create_or_get_experiment(spec()).await.unwrap();

        let idle = orchestrator.stop_run(experiment.id).await;
        assert!(!idle.stopped);
        assert_eq!(
            idle.message,
            format!("experiment {} not already running", experiment.id)
        );

        orchestrator.submit_run(experiment.id, None).await.unwrap();
        let stop = orchestrator.stop_run(experiment.id).await;
        assert!(stop.stopped);
        assert_eq!(stop.message, format!("stopped running experiment {}", experiment.id));

        let status = orchestrator.get_run_status(experiment.id).await.unwrap();
        assert_eq!(status.status, RunStatus::Cancelled);
        assert!(orchestrator.list_live_runs().await.unwrap().is_empty());

        // The experiment can be run again once stopped.
        let again = orchestrator.submit_run(experiment.id, None).await.unwrap();
        assert_eq!(again.status, SubmitStatus::Submitted);

        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().payload,
            RunEventPayload::Stopped { .. }
        ));
        assert_eq!(orchestrator.shutdown().await.unwrap(), 1);
    }

    #[test]
    fn status_view_flattens_the_experiment() {
        let experiment = Experiment::from_spec(ExperimentId::new(), spec());
        let view = ExperimentStatusView {
            experiment,
            running: true,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["tool_name"], "scenario");
        assert_eq!(json["running"], true);
    }
}
