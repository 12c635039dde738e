//! The run executor: drives an optimizer against a trial evaluator and
//! persists every scored configuration.
//!
//! A run moves `Initializing -> Iterating -> {Succeeded, Failed}`. During
//! initialization it validates the experiment snapshot and opens its own
//! store session. Each iteration asks the optimizer for one configuration,
//! evaluates it and appends a trial. A trial that fails to persist is logged
//! and skipped; an evaluator error ends the run as failed. Either way the
//! result is a [`CompletionNotice`].

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::Instrument;

use crate::backend::RunAssignment;
use crate::completion::{CompletionNotice, TerminalStatus};
use crate::error::OrchestratorError;
use crate::experiment::ExperimentSnapshot;
use crate::store::StoreConnector;
use crate::telemetry;
use crate::trial::{Configuration, Trial};

mod evaluator;

pub use evaluator::{render_command, CommandEvaluator};

/// Evaluates one configuration and returns its score (lower is better).
///
/// This is the seam to whatever actually runs the experiment's command,
/// whether a local shell or a remote compute provider.
#[async_trait]
pub trait TrialEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        snapshot: &ExperimentSnapshot,
        configuration: &Configuration,
    ) -> anyhow::Result<f64>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPhase {
    Initializing,
    Iterating,
    Succeeded,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Initializing => "initializing",
            RunPhase::Iterating => "iterating",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
        }
    }
}

pub struct RunExecutor {
    assignment: RunAssignment,
    connector: Arc<dyn StoreConnector>,
    evaluator: Arc<dyn TrialEvaluator>,
    phase: RunPhase,
    trials_recorded: u64,
}

impl std::fmt::Debug for RunExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunExecutor")
            .field("run_id", &self.assignment.run_id)
            .field("experiment_id", &self.assignment.experiment_id())
            .field("optimizer", &self.assignment.optimizer)
            .field("phase", &self.phase)
            .field("trials_recorded", &self.trials_recorded)
            .finish()
    }
}

impl RunExecutor {
    pub fn new(
        assignment: RunAssignment,
        connector: Arc<dyn StoreConnector>,
        evaluator: Arc<dyn TrialEvaluator>,
    ) -> Self {
        Self {
            assignment,
            connector,
            evaluator,
            phase: RunPhase::Initializing,
            trials_recorded: 0,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn trials_recorded(&self) -> u64 {
        self.trials_recorded
    }

    /// Run to a terminal phase and describe the outcome.
    pub async fn execute(&mut self) -> CompletionNotice {
        let run_id = self.assignment.run_id;
        let experiment_id = self.assignment.experiment_id();
        let span = telemetry::run_execute_span(run_id.to_string(), experiment_id.to_string());

        let outcome = self.iterate().instrument(span).await;
        match outcome {
            Ok(()) => {
                self.transition(RunPhase::Succeeded);
                CompletionNotice::new(
                    run_id,
                    experiment_id,
                    TerminalStatus::Finished,
                    None,
                    self.trials_recorded,
                )
            }
            Err(err) => {
                self.transition(RunPhase::Failed);
                let failure = OrchestratorError::RunFailure {
                    run_id,
                    message: format!("{err:#}"),
                };
                tracing::warn!(%experiment_id, trials = self.trials_recorded, "{failure}");
                CompletionNotice::new(
                    run_id,
                    experiment_id,
                    TerminalStatus::Failed,
                    Some(format!("{err:#}")),
                    self.trials_recorded,
                )
            }
        }
    }

    async fn iterate(&mut self) -> anyhow::Result<()> {
        let run_id = self.assignment.run_id;
        let snapshot = &self.assignment.snapshot;
        let experiment_id = snapshot.id();

        snapshot.check_version()?;
        let parameters = &snapshot.experiment.parameters;
        self.assignment.optimizer.validate_for(parameters)?;
        let store = self
            .connector
            .connect()
            .await
            .context("failed to open a store session for the run")?;
        let mut optimizer = self.assignment.optimizer.build(parameters);

        self.phase = RunPhase::Iterating;
        tracing::info!(
            %run_id,
            %experiment_id,
            optimizer = optimizer.name(),
            planned = self.assignment.optimizer.planned_evaluations(parameters),
            "run iterating"
        );

        let mut index = 0u64;
        while let Some(configuration) = optimizer.suggest() {
            let timer = telemetry::start_trial_timer(index);
            let score = self
                .evaluator
                .evaluate(snapshot, &configuration)
                .instrument(telemetry::trial_span(run_id.to_string(), index))
                .await
                .with_context(|| format!("evaluation of configuration #{index} failed"))?;

            let trial = Trial::new(experiment_id, configuration.clone(), score);
            match store.append_trial(trial).await {
                Ok(_) => {
                    self.trials_recorded += 1;
                    telemetry::record_trial(experiment_id.to_string(), score, timer.elapsed_secs());
                }
                Err(err) => {
                    let warning = OrchestratorError::PersistenceWarning {
                        experiment_id,
                        message: format!("{err:#}"),
                    };
                    telemetry::record_persistence_warning(
                        experiment_id.to_string(),
                        warning.to_string(),
                    );
                }
            }

            optimizer.observe(&configuration, score);
            index += 1;
        }
        Ok(())
    }

    fn transition(&mut self, phase: RunPhase) {
        tracing::debug!(
            run_id = %self.assignment.run_id,
            from = self.phase.as_str(),
            to = phase.as_str(),
            "run phase changed"
        );
        self.phase = phase;
    }
}
