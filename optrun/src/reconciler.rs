//! Folds run outcomes back into the registry.
//!
//! Completion notices are drained from the channel every executor reports
//! on. When the backend's liveness is authoritative, the backend is also
//! asked directly about every live run so that runs whose worker died are
//! retired too.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::WorkerBackend;
use crate::completion::{CompletionNotice, CompletionReceiver, TerminalStatus};
use crate::events::{RunEvent, RunEventBus, RunEventPayload};
use crate::registry::{Reconciled, RunRegistry, RunStatus};
use crate::telemetry;

/// What one reconciliation pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live entries removed because their run reached a terminal state.
    pub removed: usize,
    /// Notices that named a run other than the live one.
    pub anomalies: usize,
    /// Runs the backend's health check marked failed.
    pub expired: u64,
}

pub struct Reconciler {
    receiver: Mutex<CompletionReceiver>,
    registry: Arc<RunRegistry>,
    backend: Arc<dyn WorkerBackend>,
    events: Option<RunEventBus>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("live_runs", &self.registry.live_count())
            .field("capabilities", &self.backend.capabilities())
            .field("publishes_events", &self.events.is_some())
            .finish()
    }
}

fn terminal_status(status: RunStatus) -> Option<TerminalStatus> {
    match status {
        RunStatus::Finished => Some(TerminalStatus::Finished),
        RunStatus::Failed => Some(TerminalStatus::Failed),
        RunStatus::Cancelled => Some(TerminalStatus::Cancelled),
        RunStatus::Queued | RunStatus::Running => None,
    }
}

impl Reconciler {
    pub fn new(
        receiver: CompletionReceiver,
        registry: Arc<RunRegistry>,
        backend: Arc<dyn WorkerBackend>,
        events: Option<RunEventBus>,
    ) -> Self {
        Self {
            receiver: Mutex::new(receiver),
            registry,
            backend,
            events,
        }
    }

    /// Apply every pending completion notice and, for authoritative
    /// backends, poll the backend for the state of each live run.
    ///
    /// Backend errors are logged and skipped; a failed poll leaves the entry
    /// live until a later pass succeeds.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let notices = self.receiver.lock().drain();
        for notice in &notices {
            self.apply(notice, &mut report);
        }

        if self.backend.capabilities().authoritative_liveness {
            match self.backend.health_check().await {
                Ok(expired) => report.expired = expired,
                Err(err) => tracing::warn!(error = %err, "backend health check failed"),
            }
            for handle in self.registry.list() {
                match self.backend.status(&handle).await {
                    Ok(state) => match terminal_status(state.status) {
                        Some(status) => {
                            let notice = CompletionNotice::new(
                                handle.run_id,
                                handle.experiment_id,
                                status,
                                state.message,
                                state.trial_count.unwrap_or(0),
                            );
                            self.apply(&notice, &mut report);
                        }
                        None => self.registry.update_status(
                            handle.experiment_id,
                            handle.run_id,
                            state.status,
                        ),
                    },
                    Err(err) => tracing::warn!(
                        run_id = %handle.run_id,
                        experiment_id = %handle.experiment_id,
                        error = %err,
                        "could not poll run status"
                    ),
                }
            }
        }

        telemetry::set_live_runs(self.registry.live_count());
        report
    }

    fn apply(&self, notice: &CompletionNotice, report: &mut ReconcileReport) {
        match self.registry.apply_completion(notice) {
            Reconciled::Removed(handle) => {
                report.removed += 1;
                telemetry::record_run_completed(
                    handle.experiment_id.to_string(),
                    handle.run_id.to_string(),
                    handle.status.as_str(),
                    notice.trial_count,
                );
                self.publish(RunEvent::for_run(
                    handle.experiment_id,
                    handle.run_id,
                    RunEventPayload::Completed {
                        run_id: handle.run_id,
                        status: handle.status,
                        message: handle.message.clone(),
                        trial_count: notice.trial_count,
                    },
                ));
            }
            Reconciled::AlreadyRetired => {
                tracing::debug!(run_id = %notice.run_id, "notice for a stopped run");
            }
            Reconciled::Unknown => {
                tracing::debug!(
                    run_id = %notice.run_id,
                    experiment_id = %notice.experiment_id,
                    "stale completion notice ignored"
                );
            }
            Reconciled::Mismatch { live, notice: noticed } => {
                report.anomalies += 1;
                telemetry::record_reconcile_anomaly(
                    notice.experiment_id.to_string(),
                    live.to_string(),
                    noticed.to_string(),
                );
                self.publish(RunEvent::for_run(
                    notice.experiment_id,
                    noticed,
                    RunEventPayload::ReconcileAnomaly {
                        live_run: live,
                        notice_run: noticed,
                    },
                ));
            }
        }
    }

    fn publish(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
