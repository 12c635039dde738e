use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::backend::{RunAssignment, WorkerBackend};
use crate::completion::CompletionSender;
use crate::error::OrchestratorError;
use crate::events::{RunEvent, RunEventBus, RunEventPayload};
use crate::experiment::ExperimentId;
use crate::optimizer::OptimizerSpec;
use crate::reconciler::Reconciler;
use crate::registry::{RunHandle, RunId, RunRegistry};
use crate::store::ExperimentStore;
use crate::telemetry;

/// A request to run an experiment once.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub experiment_id: ExperimentId,
    /// Raw optimizer block from the caller. `None` selects the default
    /// optimizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<Value>,
}

impl RunRequest {
    pub fn new(experiment_id: ExperimentId) -> Self {
        Self {
            experiment_id,
            optimizer: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Value) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    fn optimizer_label(&self) -> &str {
        self.optimizer
            .as_ref()
            .and_then(|raw| raw.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("default")
    }
}

/// Turns run requests into started runs, at most one per experiment.
pub struct Dispatcher {
    store: Arc<dyn ExperimentStore>,
    registry: Arc<RunRegistry>,
    backend: Arc<dyn WorkerBackend>,
    completions: CompletionSender,
    reconciler: Arc<Reconciler>,
    events: Option<RunEventBus>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("live_runs", &self.registry.live_count())
            .field("capabilities", &self.backend.capabilities())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        registry: Arc<RunRegistry>,
        backend: Arc<dyn WorkerBackend>,
        completions: CompletionSender,
        reconciler: Arc<Reconciler>,
        events: Option<RunEventBus>,
    ) -> Self {
        Self {
            store,
            registry,
            backend,
            completions,
            reconciler,
            events,
        }
    }

    /// Start one run of the requested experiment.
    ///
    /// Returns as soon as the backend has accepted the run. Any rejection
    /// leaves the registry as it was before the call.
    pub async fn submit(&self, request: RunRequest) -> Result<RunHandle, OrchestratorError> {
        let span = telemetry::run_dispatch_span(
            request.experiment_id.to_string(),
            request.optimizer_label(),
        );
        let experiment_id = request.experiment_id;
        let outcome = self.dispatch(request).instrument(span).await;
        if let Err(err) = &outcome {
            telemetry::record_run_rejected(experiment_id.to_string(), rejection_reason(err));
        }
        outcome
    }

    async fn dispatch(&self, request: RunRequest) -> Result<RunHandle, OrchestratorError> {
        self.reconciler.reconcile().await;

        let experiment_id = request.experiment_id;
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await
            .map_err(OrchestratorError::store)?
            .ok_or(OrchestratorError::NotFound(experiment_id))?;

        let reservation = self
            .registry
            .reserve(experiment_id)
            .ok_or(OrchestratorError::Conflict { experiment_id })?;

        let optimizer = OptimizerSpec::from_request(request.optimizer.as_ref())?;
        optimizer.validate_for(&experiment.parameters)?;

        let assignment = RunAssignment::new(RunId::new(), experiment.snapshot(), optimizer.clone());
        let handle = self
            .backend
            .start(assignment, self.completions.clone())
            .await
            .map_err(OrchestratorError::backend)?;

        if let Err(err) = reservation.attach(handle.clone()) {
            // Only reachable on a registry bug; cancel rather than orphan.
            tracing::error!(run_id = %handle.run_id, error = %err, "could not attach started run");
            if let Err(cancel_err) = self.backend.cancel(&handle).await {
                tracing::warn!(run_id = %handle.run_id, error = %cancel_err, "orphaned run could not be cancelled");
            }
            return Err(OrchestratorError::BackendUnavailable(err.to_string()));
        }

        telemetry::record_run_submitted(experiment_id.to_string(), optimizer.name());
        tracing::info!(
            run_id = %handle.run_id,
            status = %handle.status,
            planned_evaluations = optimizer.planned_evaluations(&experiment.parameters),
            "run submitted"
        );
        if let Some(events) = &self.events {
            events.publish(RunEvent::for_run(
                experiment_id,
                handle.run_id,
                RunEventPayload::Submitted {
                    run_id: handle.run_id,
                    optimizer: optimizer.name().to_string(),
                    backend: handle.backend.clone(),
                },
            ));
        }
        Ok(handle)
    }
}

fn rejection_reason(err: &OrchestratorError) -> &'static str {
    match err {
        OrchestratorError::NotFound(_) => "not_found",
        OrchestratorError::Conflict { .. } => "already_running",
        OrchestratorError::InvalidConfig(_) => "invalid_config",
        OrchestratorError::BackendUnavailable(_) => "backend_unavailable",
        OrchestratorError::Store(_) => "store",
        OrchestratorError::RunFailure { .. } | OrchestratorError::PersistenceWarning { .. } => {
            "other"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, RunState};
    use crate::completion::completion_channel;
    use crate::experiment::{Compute, ExperimentSpec, Parameter};
    use crate::registry::{BackendRef, RunStatus};
    use crate::store::InMemoryExperimentStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Accepts every start without running anything, or refuses while
    /// `refuse` is set.
    #[derive(Default)]
    struct RecordingBackend {
        refuse: Mutex<bool>,
        started: Mutex<Vec<RunAssignment>>,
    }

    #[async_trait]
    impl WorkerBackend for RecordingBackend {
        async fn start(
            &self,
            assignment: RunAssignment,
            _completions: CompletionSender,
        ) -> anyhow::Result<RunHandle> {
            if *self.refuse.lock() {
                anyhow::bail!("no workers available");
            }
            let handle = RunHandle::new(
                assignment.run_id,
                assignment.experiment_id(),
                RunStatus::Running,
                BackendRef::Task {
                    task_id: format!("task-{}", assignment.run_id),
                },
            );
            self.started.lock().push(assignment);
            Ok(handle)
        }

        async fn status(&self, _: &RunHandle) -> anyhow::Result<RunState> {
            Ok(RunState::new(RunStatus::Running))
        }

        async fn cancel(&self, _: &RunHandle) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn list_live(&self) -> anyhow::Result<Vec<RunHandle>> {
            Ok(Vec::new())
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_cancel: true,
                authoritative_liveness: false,
            }
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        backend: Arc<RecordingBackend>,
        registry: Arc<RunRegistry>,
        experiment_id: ExperimentId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryExperimentStore::new());
        let (experiment, _) = store
            .get_or_create_experiment(ExperimentSpec {
                tool_name: "dispatch".into(),
                parameters: vec![Parameter::new("a", 0.0, 1.0).unwrap()],
                command_template_string: "run ${a}".into(),
                compute: Compute::default(),
            })
            .await
            .unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let registry = Arc::new(RunRegistry::new());
        let (tx, rx) = completion_channel();
        let reconciler = Arc::new(Reconciler::new(
            rx,
            Arc::clone(&registry),
            backend.clone(),
            None,
        ));
        Fixture {
            dispatcher: Dispatcher::new(
                store,
                Arc::clone(&registry),
                backend.clone(),
                tx,
                reconciler,
                None,
            ),
            backend,
            registry,
            experiment_id: experiment.id,
        }
    }

    #[tokio::test]
    async fn submit_starts_exactly_one_executor() {
        let fx = fixture().await;
        let handle = fx
            .dispatcher
            .submit(RunRequest::new(fx.experiment_id))
            .await
            .unwrap();
        assert_eq!(fx.registry.get(fx.experiment_id), Some(handle.clone()));

        let again = fx.dispatcher.submit(RunRequest::new(fx.experiment_id)).await;
        assert_eq!(
            again.unwrap_err(),
            OrchestratorError::Conflict {
                experiment_id: fx.experiment_id
            }
        );
        let started = fx.backend.started.lock();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].optimizer, OptimizerSpec::default());
    }

    #[tokio::test]
    async fn unknown_experiment_is_not_found() {
        let fx = fixture().await;
        let missing = ExperimentId::new();
        let err = fx
            .dispatcher
            .submit(RunRequest::new(missing))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::NotFound(missing));
        assert!(!fx.registry.is_occupied(missing));
    }

    #[tokio::test]
    async fn invalid_optimizer_releases_the_reservation() {
        let fx = fixture().await;
        let request = RunRequest::new(fx.experiment_id)
            .with_optimizer(json!({"type": "bayesopt", "n_init": "x", "n_iter": 3}));
        let err = fx.dispatcher.submit(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
        assert!(!fx.registry.is_occupied(fx.experiment_id));
        assert!(fx.backend.started.lock().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_rolls_back() {
        let fx = fixture().await;
        *fx.backend.refuse.lock() = true;
        let err = fx
            .dispatcher
            .submit(RunRequest::new(fx.experiment_id))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BackendUnavailable(_)));
        assert!(!fx.registry.is_occupied(fx.experiment_id));

        *fx.backend.refuse.lock() = false;
        let grid = RunRequest::new(fx.experiment_id)
            .with_optimizer(json!({"type": "grid", "num_configs_per_param": 5}));
        fx.dispatcher.submit(grid).await.unwrap();
        assert_eq!(
            fx.backend.started.lock()[0].optimizer,
            OptimizerSpec::Grid {
                num_configs_per_param: 5
            }
        );
    }
}
