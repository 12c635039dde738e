//! In-memory registry of live runs, keyed by experiment.
//!
//! The registry is the single source of truth for "is experiment X running"
//! inside one orchestrator. At most one reservation or live handle exists per
//! experiment at any instant; [`RunRegistry::try_reserve`] is the only place
//! that decision is made.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::completion::{CompletionNotice, TerminalStatus};
use crate::error::RegistryError;
use crate::experiment::ExperimentId;
use crate::queue::JobId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl From<TerminalStatus> for RunStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Finished => RunStatus::Finished,
            TerminalStatus::Failed => RunStatus::Failed,
            TerminalStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific reference to where a run executes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendRef {
    Task { task_id: String },
    Process { pid: u32 },
    Queue { job_id: JobId },
}

/// Lifecycle reference to one execution of an experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: RunId,
    pub experiment_id: ExperimentId,
    pub status: RunStatus,
    pub backend: BackendRef,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_count: Option<u64>,
}

impl RunHandle {
    pub fn new(
        run_id: RunId,
        experiment_id: ExperimentId,
        status: RunStatus,
        backend: BackendRef,
    ) -> Self {
        Self {
            run_id,
            experiment_id,
            status,
            backend,
            started_at: Utc::now(),
            finished_at: None,
            message: None,
            trial_count: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    fn into_terminal(
        mut self,
        status: RunStatus,
        message: Option<String>,
        trial_count: Option<u64>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        self.status = status;
        self.message = message;
        self.trial_count = trial_count.or(self.trial_count);
        self.finished_at = Some(finished_at);
        self
    }
}

/// Result of applying a completion notice to the registry.
#[derive(Clone, Debug, PartialEq)]
pub enum Reconciled {
    /// The live entry for the run was removed.
    Removed(RunHandle),
    /// The run had already been retired by an explicit stop.
    AlreadyRetired,
    /// No entry for the experiment; the notice is stale.
    Unknown,
    /// A different run is live for the same experiment. The live entry is
    /// kept and the mismatch must be reported.
    Mismatch { live: RunId, notice: RunId },
}

#[derive(Debug)]
enum Slot {
    Reserved { reserved_at: DateTime<Utc> },
    Live(RunHandle),
}

#[derive(Debug, Default)]
struct RegistryState {
    slots: HashMap<ExperimentId, Slot>,
    retired: HashMap<RunId, ExperimentId>,
    terminal: HashMap<ExperimentId, RunHandle>,
}

/// Mutex-guarded map from experiment to its current run.
#[derive(Debug, Default)]
pub struct RunRegistry {
    state: Mutex<RegistryState>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the experiment. Returns `false` if a reservation or
    /// live run already exists.
    pub fn try_reserve(&self, experiment_id: ExperimentId) -> bool {
        let mut state = self.state.lock();
        if state.slots.contains_key(&experiment_id) {
            return false;
        }
        state.slots.insert(
            experiment_id,
            Slot::Reserved {
                reserved_at: Utc::now(),
            },
        );
        true
    }

    /// Claim the experiment and get a guard that rolls the claim back on drop
    /// unless it is committed with [`Reservation::attach`].
    pub fn reserve(&self, experiment_id: ExperimentId) -> Option<Reservation<'_>> {
        self.try_reserve(experiment_id).then(|| Reservation {
            registry: self,
            experiment_id,
            committed: false,
        })
    }

    /// Replace the placeholder with the started run's handle.
    pub fn attach(
        &self,
        experiment_id: ExperimentId,
        handle: RunHandle,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        match state.slots.get_mut(&experiment_id) {
            Some(slot @ Slot::Reserved { .. }) => {
                *slot = Slot::Live(handle);
                Ok(())
            }
            Some(Slot::Live(_)) => Err(RegistryError::AlreadyAttached(experiment_id)),
            None => Err(RegistryError::NotReserved(experiment_id)),
        }
    }

    /// Drop an unattached reservation. Live entries are left untouched.
    pub fn release(&self, experiment_id: ExperimentId) -> bool {
        let mut state = self.state.lock();
        if !matches!(state.slots.get(&experiment_id), Some(Slot::Reserved { .. })) {
            return false;
        }
        state.slots.remove(&experiment_id);
        true
    }

    pub fn get(&self, experiment_id: ExperimentId) -> Option<RunHandle> {
        match self.state.lock().slots.get(&experiment_id) {
            Some(Slot::Live(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_reserved(&self, experiment_id: ExperimentId) -> bool {
        matches!(
            self.state.lock().slots.get(&experiment_id),
            Some(Slot::Reserved { .. })
        )
    }

    /// Whether the experiment has a reservation or a live run.
    pub fn is_occupied(&self, experiment_id: ExperimentId) -> bool {
        self.state.lock().slots.contains_key(&experiment_id)
    }

    /// All live handles. Pending reservations are not listed.
    pub fn list(&self) -> Vec<RunHandle> {
        let state = self.state.lock();
        let mut handles: Vec<RunHandle> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(handle) => Some(handle.clone()),
                Slot::Reserved { .. } => None,
            })
            .collect();
        handles.sort_by_key(|h| h.started_at);
        handles
    }

    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Remove a live entry outright.
    pub fn remove(&self, experiment_id: ExperimentId) -> Option<RunHandle> {
        let mut state = self.state.lock();
        if !matches!(state.slots.get(&experiment_id), Some(Slot::Live(_))) {
            return None;
        }
        match state.slots.remove(&experiment_id) {
            Some(Slot::Live(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Remove `run`'s live entry because it was stopped, recording its
    /// terminal state. Nothing happens if a different run now holds the
    /// experiment's slot.
    ///
    /// With `expects_notice`, a completion notice arriving later for this
    /// run is expected and ignored. Backends that never report on a stopped
    /// run pass `false` so nothing is kept waiting for it.
    pub fn retire(
        &self,
        run: &RunHandle,
        status: RunStatus,
        message: impl Into<String>,
        expects_notice: bool,
    ) -> Option<RunHandle> {
        let mut state = self.state.lock();
        match state.slots.get(&run.experiment_id) {
            Some(Slot::Live(live)) if live.run_id == run.run_id => {}
            _ => return None,
        }
        let Some(Slot::Live(handle)) = state.slots.remove(&run.experiment_id) else {
            return None;
        };
        let terminal = handle.into_terminal(status, Some(message.into()), None, Utc::now());
        if expects_notice {
            state.retired.insert(terminal.run_id, run.experiment_id);
        }
        state.terminal.insert(run.experiment_id, terminal.clone());
        Some(terminal)
    }

    /// Stopped runs whose completion notice has not arrived yet.
    pub fn retired_count(&self) -> usize {
        self.state.lock().retired.len()
    }

    /// Apply a completion notice.
    ///
    /// The entry is removed only when the notice names the run that is live
    /// for the experiment.
    pub fn apply_completion(&self, notice: &CompletionNotice) -> Reconciled {
        let mut state = self.state.lock();
        if state.retired.remove(&notice.run_id).is_some() {
            if let Some(terminal) = state.terminal.get_mut(&notice.experiment_id) {
                if terminal.run_id == notice.run_id {
                    terminal.trial_count = Some(notice.trial_count);
                }
            }
            return Reconciled::AlreadyRetired;
        }

        let live_run = match state.slots.get(&notice.experiment_id) {
            Some(Slot::Live(handle)) => handle.run_id,
            Some(Slot::Reserved { .. }) | None => return Reconciled::Unknown,
        };
        if live_run != notice.run_id {
            return Reconciled::Mismatch {
                live: live_run,
                notice: notice.run_id,
            };
        }

        let Some(Slot::Live(handle)) = state.slots.remove(&notice.experiment_id) else {
            return Reconciled::Unknown;
        };
        let terminal = handle.into_terminal(
            notice.status.into(),
            notice.message.clone(),
            Some(notice.trial_count),
            notice.finished_at,
        );
        state
            .terminal
            .insert(notice.experiment_id, terminal.clone());
        Reconciled::Removed(terminal)
    }

    /// Refresh the status of a live entry, e.g. queued -> running.
    pub fn update_status(&self, experiment_id: ExperimentId, run_id: RunId, status: RunStatus) {
        if status.is_terminal() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(Slot::Live(handle)) = state.slots.get_mut(&experiment_id) {
            if handle.run_id == run_id {
                handle.status = status;
            }
        }
    }

    /// Most recent terminal handle recorded for the experiment.
    pub fn last_terminal(&self, experiment_id: ExperimentId) -> Option<RunHandle> {
        self.state.lock().terminal.get(&experiment_id).cloned()
    }

    /// Age of a pending reservation, for diagnostics.
    pub fn reservation_age(&self, experiment_id: ExperimentId) -> Option<chrono::Duration> {
        match self.state.lock().slots.get(&experiment_id) {
            Some(Slot::Reserved { reserved_at }) => Some(Utc::now() - *reserved_at),
            _ => None,
        }
    }
}

/// Pending claim on an experiment. Dropping it without attaching a handle
/// releases the claim.
#[derive(Debug)]
pub struct Reservation<'a> {
    registry: &'a RunRegistry,
    experiment_id: ExperimentId,
    committed: bool,
}

impl Reservation<'_> {
    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    pub fn attach(mut self, handle: RunHandle) -> Result<(), RegistryError> {
        self.registry.attach(self.experiment_id, handle)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(self.experiment_id);
        }
    }
}
