use std::sync::Arc;

use async_trait::async_trait;

use crate::completion::CompletionSender;
use crate::queue::{JobId, JobQueue, JobRecord, JobState, LeaseExpiryScanner};
use crate::registry::{BackendRef, RunHandle, RunStatus};

use super::{Capabilities, RunAssignment, RunState, WorkerBackend};

/// Hands runs to a durable job queue drained by a separate worker pool.
///
/// Every status read goes to the queue. Jobs that a worker has already
/// started cannot be cancelled; `cancel` reports `false` for them.
pub struct QueueBackend<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    queue: Arc<Q>,
}

impl<Q> std::fmt::Debug for QueueBackend<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBackend")
            .field("queue_type", &std::any::type_name::<Q>())
            .finish()
    }
}

impl<Q> QueueBackend<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    pub fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    fn job_id(handle: &RunHandle) -> anyhow::Result<JobId> {
        match &handle.backend {
            BackendRef::Queue { job_id } => Ok(*job_id),
            other => anyhow::bail!("run {} is not a queue job: {other:?}", handle.run_id),
        }
    }
}

fn handle_from_record(record: &JobRecord) -> RunHandle {
    let mut handle = RunHandle::new(
        record.run_id,
        record.experiment_id,
        record.state.into(),
        BackendRef::Queue {
            job_id: record.job_id,
        },
    );
    handle.started_at = record.started_at.unwrap_or(record.enqueued_at);
    handle.finished_at = record.finished_at;
    handle.message = record.message.clone();
    handle.trial_count = record.trial_count;
    handle
}

#[async_trait]
impl<Q> WorkerBackend for QueueBackend<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    /// Enqueue the run. Queue workers record outcomes on the job itself, so
    /// `completions` is not used; the reconciler learns of terminal jobs by
    /// asking the queue.
    async fn start(
        &self,
        assignment: RunAssignment,
        _completions: CompletionSender,
    ) -> anyhow::Result<RunHandle> {
        let record = self.queue.enqueue(assignment).await?;
        tracing::info!(
            run_id = %record.run_id,
            experiment_id = %record.experiment_id,
            job_id = %record.job_id,
            "run enqueued"
        );
        Ok(handle_from_record(&record))
    }

    async fn status(&self, handle: &RunHandle) -> anyhow::Result<RunState> {
        let job_id = Self::job_id(handle)?;
        let record = self
            .queue
            .job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("queue has no job {job_id}"))?;
        Ok(RunState {
            status: RunStatus::from(record.state),
            message: record.message,
            trial_count: record.trial_count,
        })
    }

    async fn cancel(&self, handle: &RunHandle) -> anyhow::Result<bool> {
        let job_id = Self::job_id(handle)?;
        if self.queue.cancel(job_id).await? {
            tracing::info!(run_id = %handle.run_id, %job_id, "queued run cancelled");
            return Ok(true);
        }
        let state = self.queue.job(job_id).await?.map(|record| record.state);
        if state == Some(JobState::Started) {
            tracing::warn!(
                run_id = %handle.run_id,
                %job_id,
                "run is executing on a queue worker and cannot be interrupted"
            );
        }
        Ok(false)
    }

    async fn list_live(&self) -> anyhow::Result<Vec<RunHandle>> {
        let records = self.queue.live_jobs().await?;
        Ok(records.iter().map(handle_from_record).collect())
    }

    async fn health_check(&self) -> anyhow::Result<u64> {
        self.queue.scan_expired_leases().await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_cancel: false,
            authoritative_liveness: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{completion_channel, CompletionNotice, TerminalStatus};
    use crate::experiment::{Compute, Experiment, ExperimentId, ExperimentSpec, Parameter};
    use crate::optimizer::OptimizerSpec;
    use crate::queue::InMemoryJobQueue;
    use crate::registry::RunId;
    use chrono::Duration;

    fn assignment() -> RunAssignment {
        let spec = ExperimentSpec {
            tool_name: "q".into(),
            parameters: vec![Parameter::new("a", 0.0, 1.0).unwrap()],
            command_template_string: "true".into(),
            compute: Compute::default(),
        };
        RunAssignment::new(
            RunId::new(),
            Experiment::from_spec(ExperimentId::new(), spec).snapshot(),
            OptimizerSpec::default(),
        )
    }

    #[tokio::test]
    async fn status_follows_the_queue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let backend = QueueBackend::new(Arc::clone(&queue));
        let (tx, _rx) = completion_channel();

        let handle = backend.start(assignment(), tx).await.unwrap();
        assert_eq!(handle.status, RunStatus::Queued);
        assert_eq!(backend.status(&handle).await.unwrap().status, RunStatus::Queued);

        let lease = queue
            .dequeue("w0", Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.status(&handle).await.unwrap().status, RunStatus::Running);
        assert_eq!(backend.list_live().await.unwrap().len(), 1);

        let notice = CompletionNotice::new(
            handle.run_id,
            handle.experiment_id,
            TerminalStatus::Finished,
            None,
            4,
        );
        queue.complete(lease.lease_id, &notice).await.unwrap();
        let state = backend.status(&handle).await.unwrap();
        assert_eq!(state.status, RunStatus::Finished);
        assert_eq!(state.trial_count, Some(4));
        assert!(backend.list_live().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_jobs_cannot_be_cancelled() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let backend = QueueBackend::new(Arc::clone(&queue));
        let (tx, _rx) = completion_channel();

        let running = backend.start(assignment(), tx.clone()).await.unwrap();
        let waiting = backend.start(assignment(), tx).await.unwrap();
        queue.dequeue("w0", Duration::seconds(30)).await.unwrap();

        assert!(!backend.cancel(&running).await.unwrap());
        assert!(backend.cancel(&waiting).await.unwrap());
        assert_eq!(
            backend.status(&waiting).await.unwrap().status,
            RunStatus::Cancelled
        );
        assert!(!backend.capabilities().supports_cancel);
    }

    #[tokio::test]
    async fn health_check_fails_evicted_workers() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let backend = QueueBackend::new(Arc::clone(&queue));
        let (tx, _rx) = completion_channel();

        let handle = backend.start(assignment(), tx).await.unwrap();
        queue
            .dequeue("w0", Duration::milliseconds(-1))
            .await
            .unwrap();

        assert_eq!(backend.health_check().await.unwrap(), 1);
        assert_eq!(backend.status(&handle).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn non_queue_handles_are_rejected() {
        let backend = QueueBackend::new(Arc::new(InMemoryJobQueue::new()));
        let handle = RunHandle::new(
            RunId::new(),
            ExperimentId::new(),
            RunStatus::Running,
            BackendRef::Process { pid: 1 },
        );
        assert!(backend.status(&handle).await.is_err());
    }
}
