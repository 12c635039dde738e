//! Completion notices flowing from finished runs back to the orchestrator.
//!
//! The channel is unbounded so that a burst of completions is never dropped
//! while nobody is draining. [`NotifyOnExit`] guarantees that a run emits
//! exactly one notice however it ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::experiment::ExperimentId;
use crate::registry::RunId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Finished,
    Failed,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Finished => "finished",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal report of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub run_id: RunId,
    pub experiment_id: ExperimentId,
    pub status: TerminalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub trial_count: u64,
    pub finished_at: DateTime<Utc>,
}

impl CompletionNotice {
    pub fn new(
        run_id: RunId,
        experiment_id: ExperimentId,
        status: TerminalStatus,
        message: Option<String>,
        trial_count: u64,
    ) -> Self {
        Self {
            run_id,
            experiment_id,
            status,
            message,
            trial_count,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        run_id: RunId,
        experiment_id: ExperimentId,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            experiment_id,
            TerminalStatus::Failed,
            Some(message.into()),
            0,
        )
    }
}

/// Sending half of the completion channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<CompletionNotice>,
}

impl CompletionSender {
    /// Deliver a notice. Returns `false` only if the orchestrator is gone.
    pub fn send(&self, notice: CompletionNotice) -> bool {
        match self.tx.send(notice) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    run_id = %err.0.run_id,
                    experiment_id = %err.0.experiment_id,
                    "completion notice dropped: receiver closed"
                );
                false
            }
        }
    }
}

/// Receiving half of the completion channel.
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<CompletionNotice>,
}

impl CompletionReceiver {
    /// Take every notice currently queued without waiting.
    pub fn drain(&mut self) -> Vec<CompletionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    /// Wait for the next notice.
    pub async fn recv(&mut self) -> Option<CompletionNotice> {
        self.rx.recv().await
    }
}

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// Scoped guard that always reports a run's end.
///
/// Call [`NotifyOnExit::finish`] with the real outcome. If the guard is
/// dropped first (panic, task abort, early return) it reports the run as
/// failed instead.
#[derive(Debug)]
pub struct NotifyOnExit {
    sender: CompletionSender,
    run_id: RunId,
    experiment_id: ExperimentId,
    armed: bool,
}

impl NotifyOnExit {
    pub fn new(sender: CompletionSender, run_id: RunId, experiment_id: ExperimentId) -> Self {
        Self {
            sender,
            run_id,
            experiment_id,
            armed: true,
        }
    }

    pub fn finish(mut self, notice: CompletionNotice) {
        self.armed = false;
        self.sender.send(notice);
    }
}

impl Drop for NotifyOnExit {
    fn drop(&mut self) {
        if self.armed {
            self.sender.send(CompletionNotice::failed(
                self.run_id,
                self.experiment_id,
                "run terminated before reporting completion",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_everything_queued() {
        let (tx, mut rx) = completion_channel();
        let exp = ExperimentId::new();
        for _ in 0..1000 {
            assert!(tx.send(CompletionNotice::failed(RunId::new(), exp, "x")));
        }
        assert_eq!(rx.drain().len(), 1000);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn guard_reports_failure_when_dropped_unfinished() {
        let (tx, mut rx) = completion_channel();
        let run = RunId::new();
        let exp = ExperimentId::new();
        drop(NotifyOnExit::new(tx, run, exp));

        let notices = rx.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].run_id, run);
        assert_eq!(notices[0].status, TerminalStatus::Failed);
    }

    #[test]
    fn finished_guard_sends_exactly_once() {
        let (tx, mut rx) = completion_channel();
        let run = RunId::new();
        let exp = ExperimentId::new();
        let guard = NotifyOnExit::new(tx, run, exp);
        guard.finish(CompletionNotice::new(
            run,
            exp,
            TerminalStatus::Finished,
            None,
            4,
        ));

        let notices = rx.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].status, TerminalStatus::Finished);
        assert_eq!(notices[0].trial_count, 4);
    }

    #[test]
    fn guard_fires_when_task_is_aborted() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (tx, mut rx) = completion_channel();
        rt.block_on(async move {
            let guard = NotifyOnExit::new(tx, RunId::new(), ExperimentId::new());
            let task = tokio::spawn(async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            });
            tokio::task::yield_now().await;
            task.abort();
            assert!(task.await.unwrap_err().is_cancelled());
        });
        assert_eq!(rx.drain().len(), 1);
    }
}
