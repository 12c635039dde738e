use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use optrun::*;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Refuses the first `failures` starts, then delegates to `inner`.
pub struct FlakyBackend {
    inner: Arc<dyn WorkerBackend>,
    remaining_failures: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl FlakyBackend {
    pub fn new(inner: Arc<dyn WorkerBackend>, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: Mutex::new(failures),
            attempts: Mutex::new(0),
        }
    }

    /// Start attempts seen, including refused ones.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl WorkerBackend for FlakyBackend {
    async fn start(
        &self,
        assignment: RunAssignment,
        completions: CompletionSender,
    ) -> anyhow::Result<RunHandle> {
        *self.attempts.lock() += 1;
        let refuse = {
            let mut remaining = self.remaining_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if refuse {
            anyhow::bail!("injected start failure for run {}", assignment.run_id);
        }
        self.inner.start(assignment, completions).await
    }

    async fn status(&self, handle: &RunHandle) -> anyhow::Result<RunState> {
        self.inner.status(handle).await
    }

    async fn cancel(&self, handle: &RunHandle) -> anyhow::Result<bool> {
        self.inner.cancel(handle).await
    }

    async fn list_live(&self) -> anyhow::Result<Vec<RunHandle>> {
        self.inner.list_live().await
    }

    async fn health_check(&self) -> anyhow::Result<u64> {
        self.inner.health_check().await
    }

    async fn shutdown(&self) -> anyhow::Result<usize> {
        self.inner.shutdown().await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}

/// Delegates to `inner` while tracking the most runs of a single experiment
/// the backend ever held at once.
///
/// `cancel` yields after delegating so stops interleave with other requests.
/// A parked backend instead waits in `cancel` until [`Self::release_cancel`].
pub struct ObservedBackend {
    inner: Arc<dyn WorkerBackend>,
    max_live: AtomicUsize,
    parked: bool,
    cancel_entered: Notify,
    cancel_gate: Notify,
}

impl ObservedBackend {
    pub fn new(inner: Arc<dyn WorkerBackend>) -> Self {
        Self {
            inner,
            max_live: AtomicUsize::new(0),
            parked: false,
            cancel_entered: Notify::new(),
            cancel_gate: Notify::new(),
        }
    }

    /// Hold every `cancel` after it reached `inner` until released.
    pub fn parked(inner: Arc<dyn WorkerBackend>) -> Self {
        Self {
            parked: true,
            ..Self::new(inner)
        }
    }

    /// Highest number of live runs seen for one experiment.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Resolves once a `cancel` call is waiting on the gate.
    pub async fn cancel_entered(&self) {
        self.cancel_entered.notified().await;
    }

    pub fn release_cancel(&self) {
        self.cancel_gate.notify_one();
    }
}

#[async_trait]
impl WorkerBackend for ObservedBackend {
    async fn start(
        &self,
        assignment: RunAssignment,
        completions: CompletionSender,
    ) -> anyhow::Result<RunHandle> {
        let handle = self.inner.start(assignment, completions).await?;
        let live = self
            .inner
            .list_live()
            .await?
            .iter()
            .filter(|h| h.experiment_id == handle.experiment_id)
            .count();
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(handle)
    }

    async fn status(&self, handle: &RunHandle) -> anyhow::Result<RunState> {
        self.inner.status(handle).await
    }

    async fn cancel(&self, handle: &RunHandle) -> anyhow::Result<bool> {
        let cancelled = self.inner.cancel(handle).await?;
        if self.parked {
            self.cancel_entered.notify_one();
            self.cancel_gate.notified().await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(cancelled)
    }

    async fn list_live(&self) -> anyhow::Result<Vec<RunHandle>> {
        self.inner.list_live().await
    }

    async fn health_check(&self) -> anyhow::Result<u64> {
        self.inner.health_check().await
    }

    async fn shutdown(&self) -> anyhow::Result<usize> {
        self.inner.shutdown().await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
