use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::completion::{CompletionSender, NotifyOnExit};
use crate::config::LaunchMode;
use crate::executor::{RunExecutor, TrialEvaluator};
use crate::registry::{BackendRef, RunHandle, RunId, RunStatus};
use crate::store::StoreConnector;
use crate::telemetry;

use super::process;
use super::{Capabilities, RunAssignment, RunState, WorkerBackend};

#[derive(Clone)]
enum Launcher {
    Task {
        connector: Arc<dyn StoreConnector>,
        evaluator: Arc<dyn TrialEvaluator>,
    },
    Process {
        program: String,
        args: Vec<String>,
    },
}

enum Interrupt {
    Abort(AbortHandle),
    Kill(oneshot::Sender<()>),
}

struct LiveRun {
    handle: RunHandle,
    interrupt: Interrupt,
}

type LiveRuns = Arc<Mutex<HashMap<RunId, LiveRun>>>;

/// Removes a run from the live map when its supervising task ends, however
/// it ends.
struct Untrack {
    live: LiveRuns,
    run_id: RunId,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.live.lock().remove(&self.run_id);
    }
}

/// Runs each executor on this host, either as a tokio task or as one child
/// process per run.
///
/// Liveness is whatever this process has observed: a run is live from the
/// moment it is started until its completion notice is sent or it is
/// cancelled.
#[derive(Clone)]
pub struct LocalBackend {
    launcher: Launcher,
    live: LiveRuns,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.launcher {
            Launcher::Task { .. } => "task".to_string(),
            Launcher::Process { program, .. } => format!("process:{program}"),
        };
        f.debug_struct("LocalBackend")
            .field("mode", &mode)
            .field("live_runs", &self.live.lock().len())
            .finish()
    }
}

impl LocalBackend {
    /// Execute runs as tasks on the current tokio runtime.
    pub fn in_process(
        connector: Arc<dyn StoreConnector>,
        evaluator: Arc<dyn TrialEvaluator>,
    ) -> Self {
        Self::with_launcher(Launcher::Task {
            connector,
            evaluator,
        })
    }

    /// Execute each run in a new `program` process. The program reads a
    /// `RunAssignment` from stdin and prints its `CompletionNotice` last.
    pub fn child_process(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_launcher(Launcher::Process {
            program: program.into(),
            args,
        })
    }

    /// Pick the launcher from configuration. The connector and evaluator are
    /// only used for [`LaunchMode::Task`].
    pub fn from_launch_mode(
        mode: &LaunchMode,
        connector: Arc<dyn StoreConnector>,
        evaluator: Arc<dyn TrialEvaluator>,
    ) -> Self {
        match mode {
            LaunchMode::Task => Self::in_process(connector, evaluator),
            LaunchMode::Process { program, args } => Self::child_process(program.clone(), args.clone()),
        }
    }

    fn with_launcher(launcher: Launcher) -> Self {
        Self {
            launcher,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Cancel every live run. Used when the orchestrator shuts down.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<LiveRun> = self.live.lock().drain().map(|(_, run)| run).collect();
        let count = drained.len();
        for run in drained {
            interrupt(run.interrupt);
        }
        count
    }

    fn start_task(
        &self,
        assignment: RunAssignment,
        completions: CompletionSender,
        connector: Arc<dyn StoreConnector>,
        evaluator: Arc<dyn TrialEvaluator>,
    ) -> RunHandle {
        let run_id = assignment.run_id;
        let experiment_id = assignment.experiment_id();
        let handle = RunHandle::new(
            run_id,
            experiment_id,
            RunStatus::Running,
            BackendRef::Task {
                task_id: format!("task-{run_id}"),
            },
        );

        let guard = NotifyOnExit::new(completions, run_id, experiment_id);
        let untrack = Untrack {
            live: Arc::clone(&self.live),
            run_id,
        };
        let mut executor = RunExecutor::new(assignment, connector, evaluator);

        // Hold the map while spawning so a run that finishes instantly cannot
        // untrack itself before it was tracked.
        let mut live = self.live.lock();
        let task = tokio::spawn(telemetry::instrument_run(
            run_id.to_string(),
            experiment_id.to_string(),
            async move {
                let notice = executor.execute().await;
                drop(untrack);
                guard.finish(notice);
            },
        ));
        live.insert(
            run_id,
            LiveRun {
                handle: handle.clone(),
                interrupt: Interrupt::Abort(task.abort_handle()),
            },
        );
        handle
    }

    async fn start_process(
        &self,
        assignment: RunAssignment,
        completions: CompletionSender,
        program: &str,
        args: &[String],
    ) -> anyhow::Result<RunHandle> {
        let run_id = assignment.run_id;
        let experiment_id = assignment.experiment_id();

        let spawned = process::spawn_child(program, args, &assignment).await?;
        let pid = spawned.pid;
        let handle = RunHandle::new(
            run_id,
            experiment_id,
            RunStatus::Running,
            BackendRef::Process { pid },
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let guard = NotifyOnExit::new(completions, run_id, experiment_id);
        let untrack = Untrack {
            live: Arc::clone(&self.live),
            run_id,
        };

        let mut live = self.live.lock();
        tokio::spawn(async move {
            let notice = process::supervise(spawned, &assignment, kill_rx).await;
            drop(untrack);
            guard.finish(notice);
        });
        live.insert(
            run_id,
            LiveRun {
                handle: handle.clone(),
                interrupt: Interrupt::Kill(kill_tx),
            },
        );
        tracing::info!(%run_id, %experiment_id, pid, "worker process started");
        Ok(handle)
    }
}

fn interrupt(interrupt: Interrupt) {
    match interrupt {
        Interrupt::Abort(task) => task.abort(),
        Interrupt::Kill(kill) => {
            let _ = kill.send(());
        }
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    async fn start(
        &self,
        assignment: RunAssignment,
        completions: CompletionSender,
    ) -> anyhow::Result<RunHandle> {
        match self.launcher.clone() {
            Launcher::Task {
                connector,
                evaluator,
            } => Ok(self.start_task(assignment, completions, connector, evaluator)),
            Launcher::Process { program, args } => {
                self.start_process(assignment, completions, &program, &args)
                    .await
            }
        }
    }

    async fn status(&self, handle: &RunHandle) -> anyhow::Result<RunState> {
        if self.live.lock().contains_key(&handle.run_id) {
            return Ok(RunState::new(RunStatus::Running));
        }
        anyhow::bail!(
            "run {} is not tracked by the local backend; its outcome is known only from its completion notice",
            handle.run_id
        )
    }

    async fn cancel(&self, handle: &RunHandle) -> anyhow::Result<bool> {
        let Some(run) = self.live.lock().remove(&handle.run_id) else {
            return Ok(false);
        };
        interrupt(run.interrupt);
        tracing::info!(run_id = %handle.run_id, "local run cancelled");
        Ok(true)
    }

    async fn list_live(&self) -> anyhow::Result<Vec<RunHandle>> {
        let mut handles: Vec<RunHandle> = self
            .live
            .lock()
            .values()
            .map(|run| run.handle.clone())
            .collect();
        handles.sort_by_key(|h| h.started_at);
        Ok(handles)
    }

    async fn shutdown(&self) -> anyhow::Result<usize> {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled live local runs on shutdown");
        }
        Ok(cancelled)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_cancel: true,
            authoritative_liveness: false,
        }
    }
}
