use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::completion::{CompletionNotice, CompletionSender, TerminalStatus};
use crate::config::QueueConfig;
use crate::executor::{RunExecutor, TrialEvaluator};
use crate::queue::{JobLease, JobQueue, LeaseExpiryScanner, LeaseRenewal};
use crate::store::StoreConnector;
use crate::telemetry;

use super::worker::WorkerConfig;
use super::ShutdownToken;

/// Pool of workers draining a [`JobQueue`] and running each leased job's
/// executor to completion.
///
/// A worker holds one lease at a time and renews it in the background while
/// the run executes. The outcome is recorded on the job; with
/// `with_completions` it is also forwarded to an in-process orchestrator.
pub struct QueueWorkerPool<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    queue: Arc<Q>,
    connector: Arc<dyn StoreConnector>,
    evaluator: Arc<dyn TrialEvaluator>,
    queue_config: QueueConfig,
    worker_config: WorkerConfig,
    completions: Option<CompletionSender>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<Q> fmt::Debug for QueueWorkerPool<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("QueueWorkerPool")
            .field("queue_type", &type_name::<Q>())
            .field("queue_config", &self.queue_config)
            .field("worker_config", &self.worker_config)
            .field("forwards_completions", &self.completions.is_some())
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

/// Everything one worker task needs, cloned per worker.
struct WorkerContext<Q> {
    worker_id: String,
    queue: Arc<Q>,
    connector: Arc<dyn StoreConnector>,
    evaluator: Arc<dyn TrialEvaluator>,
    queue_config: QueueConfig,
    worker_config: WorkerConfig,
    completions: Option<CompletionSender>,
    shutdown: ShutdownToken,
}

impl<Q> QueueWorkerPool<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        connector: Arc<dyn StoreConnector>,
        evaluator: Arc<dyn TrialEvaluator>,
        queue_config: QueueConfig,
        worker_config: WorkerConfig,
        completions: Option<CompletionSender>,
    ) -> Self {
        Self {
            queue,
            connector,
            evaluator,
            queue_config,
            worker_config,
            completions,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue_config
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn `parallelism` workers.
    pub async fn spawn_workers(&self, parallelism: usize) {
        let mut handles = self.worker_handles.lock().await;
        let offset = handles.len();
        for i in 0..parallelism {
            let context = WorkerContext {
                worker_id: format!("{}-w{}", self.worker_config.worker_id, offset + i),
                queue: Arc::clone(&self.queue),
                connector: Arc::clone(&self.connector),
                evaluator: Arc::clone(&self.evaluator),
                queue_config: self.queue_config.clone(),
                worker_config: self.worker_config.clone(),
                completions: self.completions.clone(),
                shutdown: self.shutdown_token.clone(),
            };
            handles.push(tokio::spawn(Self::worker_loop(context)));
        }
        tracing::info!(
            queue = %self.queue_config.queue_name,
            spawned = parallelism,
            total = handles.len(),
            "queue workers started"
        );
    }

    /// Spawn a housekeeper task for scanning expired leases.
    pub fn spawn_housekeeper(&self) {
        let q = self.queue();
        let interval = tokio::time::Duration::from_millis(self.queue_config.housekeeper_interval_ms);
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match q.scan_expired_leases().await {
                            Ok(0) => {}
                            Ok(expired) => tracing::info!(expired, "housekeeper failed runs with expired leases"),
                            Err(err) => tracing::warn!("housekeeper scan_expired_leases error: {err}"),
                        }
                    }
                }
            }
        });
    }

    /// Stop taking new jobs and wait for in-flight runs to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of queue worker pool");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(tokio::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Worker task timed out during shutdown")
                }
            }
        }

        tracing::info!("Queue worker pool shutdown complete");
        Ok(())
    }

    async fn worker_loop(context: WorkerContext<Q>) {
        let lease_ttl = Duration::seconds(context.queue_config.lease_ttl_secs);
        let mut idle_polls = 0u32;

        loop {
            if context.shutdown.is_cancelled() {
                tracing::info!("Worker {} shutting down", context.worker_id);
                break;
            }

            let span = telemetry::queue_dequeue_span(&context.worker_id, &context.queue_config.queue_name);
            let delay = match context
                .queue
                .dequeue(&context.worker_id, lease_ttl)
                .instrument(span)
                .await
            {
                Ok(Some(lease)) => {
                    idle_polls = 0;
                    Self::run_leased(&context, lease, lease_ttl).await;
                    continue;
                }
                Ok(None) => {
                    idle_polls = idle_polls.saturating_add(1);
                    context.worker_config.idle_delay(idle_polls)
                }
                Err(err) => {
                    tracing::warn!(worker_id = %context.worker_id, "dequeue error: {err}");
                    tokio::time::Duration::from_millis(context.worker_config.backoff_ms)
                }
            };

            tokio::select! {
                _ = context.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_leased(context: &WorkerContext<Q>, lease: JobLease, ttl: Duration) {
        let JobLease {
            job_id,
            lease_id,
            assignment,
            expires_at,
            ..
        } = lease;
        let run_id = assignment.run_id;
        let experiment_id = assignment.experiment_id();
        tracing::info!(worker_id = %context.worker_id, %job_id, %run_id, %experiment_id, "run leased");

        let renew_margin = tokio::time::Duration::from_secs(context.worker_config.renew_min_margin_secs);
        let renew_fraction = context.worker_config.renew_at_fraction;
        let (cancel_tx, mut cancel_rx) = tokio::sync::mpsc::channel::<()>(1);
        let (lost_tx, lost_rx) = tokio::sync::oneshot::channel::<anyhow::Error>();

        let mut local_expires_at = expires_at;
        let renewer_q = Arc::clone(&context.queue);
        let worker_id = context.worker_id.clone();
        let renew_handle = tokio::spawn(async move {
            let lost = loop {
                let now = chrono::Utc::now();
                let mut sleep_dur = tokio::time::Duration::from_millis(500);
                if local_expires_at > now {
                    let ttl_total = ttl
                        .to_std()
                        .unwrap_or(tokio::time::Duration::from_secs(30));
                    let target = ttl_total.mul_f32(renew_fraction);
                    let remaining = (local_expires_at - now)
                        .to_std()
                        .unwrap_or(tokio::time::Duration::from_millis(0));
                    sleep_dur = if remaining > target {
                        remaining - target
                    } else if remaining > renew_margin {
                        remaining - renew_margin
                    } else {
                        tokio::time::Duration::from_millis(0)
                    };
                }

                tokio::select! {
                    _ = tokio::time::sleep(sleep_dur) => {}
                    _ = cancel_rx.recv() => { break None; }
                }

                match renewer_q
                    .renew(LeaseRenewal {
                        lease_id,
                        worker_id: worker_id.clone(),
                        extend_by: ttl,
                    })
                    .await
                {
                    Ok(updated) => {
                        local_expires_at = updated.expires_at;
                        tracing::trace!(%lease_id, renewals = updated.renewals, "lease renewed");
                    }
                    Err(err) => {
                        tracing::warn!(%lease_id, "lease renew failed: {err}");
                        break Some(err);
                    }
                }
            };
            if let Some(err) = lost {
                let _ = lost_tx.send(err);
            }
        });

        let mut executor = RunExecutor::new(
            assignment,
            Arc::clone(&context.connector),
            Arc::clone(&context.evaluator),
        );
        let job_timeout = context.queue_config.job_timeout_secs;
        let run = async {
            match job_timeout {
                Some(secs) => {
                    let limit = tokio::time::Duration::from_secs(secs);
                    let outcome = tokio::time::timeout(limit, executor.execute()).await;
                    match outcome {
                        Ok(notice) => notice,
                        Err(_) => {
                            tracing::warn!(%run_id, %experiment_id, secs, "run timed out");
                            CompletionNotice::new(
                                run_id,
                                experiment_id,
                                TerminalStatus::Failed,
                                Some(format!("run exceeded the job timeout of {secs}s")),
                                executor.trials_recorded(),
                            )
                        }
                    }
                }
                None => executor.execute().await,
            }
        };

        // Losing the lease means the job was already failed elsewhere and
        // may be resubmitted; the run must not keep writing trials.
        let outcome = tokio::select! {
            notice = run => Some(notice),
            Ok(err) = lost_rx => {
                tracing::warn!(
                    worker_id = %context.worker_id,
                    %job_id,
                    %run_id,
                    %experiment_id,
                    error = %err,
                    "lease lost, abandoning run"
                );
                None
            }
        };

        let _ = cancel_tx.try_send(());
        let _ = renew_handle.await;

        let Some(notice) = outcome else {
            tracing::info!(
                worker_id = %context.worker_id,
                %job_id,
                %run_id,
                trials = executor.trials_recorded(),
                "run abandoned on queue worker"
            );
            return;
        };

        if let Err(err) = context.queue.complete(lease_id, &notice).await {
            tracing::error!(%job_id, %run_id, "queue complete error: {err}");
        }
        tracing::info!(
            worker_id = %context.worker_id,
            %job_id,
            %run_id,
            status = notice.status.as_str(),
            trials = notice.trial_count,
            "run finished on queue worker"
        );
        if let Some(completions) = &context.completions {
            completions.send(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RunAssignment;
    use crate::experiment::{Compute, ExperimentSnapshot, ExperimentSpec, Parameter};
    use crate::optimizer::OptimizerSpec;
    use crate::queue::{InMemoryJobQueue, JobState};
    use crate::registry::RunId;
    use crate::store::{ExperimentStore, InMemoryExperimentStore};
    use crate::trial::Configuration;
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    struct Sum;

    #[async_trait]
    impl TrialEvaluator for Sum {
        async fn evaluate(&self, _: &ExperimentSnapshot, c: &Configuration) -> anyhow::Result<f64> {
            Ok(c.values().sum())
        }
    }

    struct Slow;

    #[async_trait]
    impl TrialEvaluator for Slow {
        async fn evaluate(&self, _: &ExperimentSnapshot, _: &Configuration) -> anyhow::Result<f64> {
            tokio::time::sleep(StdDuration::from_secs(30)).await;
            Ok(0.0)
        }
    }

    async fn enqueue(queue: &InMemoryJobQueue, store: &InMemoryExperimentStore) -> crate::queue::JobRecord {
        let (experiment, _) = store
            .get_or_create_experiment(ExperimentSpec {
                tool_name: "pool".into(),
                parameters: vec![Parameter::new("a", 0.0, 1.0).unwrap()],
                command_template_string: "run ${a}".into(),
                compute: Compute::default(),
            })
            .await
            .unwrap();
        queue
            .enqueue(RunAssignment::new(
                RunId::new(),
                experiment.snapshot(),
                OptimizerSpec::default(),
            ))
            .await
            .unwrap()
    }

    async fn wait_state(queue: &InMemoryJobQueue, record: &crate::queue::JobRecord) -> JobState {
        timeout(StdDuration::from_secs(5), async {
            loop {
                let state = queue.job(record.job_id).await.unwrap().unwrap().state;
                if !state.is_live() {
                    return state;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not finish")
    }

    fn pool(
        queue: Arc<InMemoryJobQueue>,
        store: InMemoryExperimentStore,
        evaluator: Arc<dyn TrialEvaluator>,
        queue_config: QueueConfig,
        completions: Option<CompletionSender>,
    ) -> QueueWorkerPool<InMemoryJobQueue> {
        QueueWorkerPool::new(
            queue,
            Arc::new(store),
            evaluator,
            queue_config,
            WorkerConfig::new("test").with_poll_interval(5),
            completions,
        )
    }

    #[tokio::test]
    async fn workers_run_jobs_and_record_outcomes() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let store = InMemoryExperimentStore::new();
        let (tx, mut rx) = crate::completion::completion_channel();
        let record = enqueue(&queue, &store).await;

        let pool = pool(
            Arc::clone(&queue),
            store.clone(),
            Arc::new(Sum),
            QueueConfig::default(),
            Some(tx),
        );
        pool.spawn_workers(2).await;

        assert_eq!(wait_state(&queue, &record).await, JobState::Finished);
        let finished = queue.job(record.job_id).await.unwrap().unwrap();
        assert_eq!(finished.trial_count, Some(4));
        assert_eq!(store.trial_count(record.experiment_id), 4);

        let notice = timeout(StdDuration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(notice.run_id, record.run_id);

        timeout(StdDuration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown did not complete")
            .unwrap();
    }

    #[tokio::test]
    async fn job_timeout_fails_the_run() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let store = InMemoryExperimentStore::new();
        let record = enqueue(&queue, &store).await;

        let mut config = QueueConfig::default();
        config.job_timeout_secs = Some(0);
        let pool = pool(Arc::clone(&queue), store, Arc::new(Slow), config, None);
        pool.spawn_workers(1).await;

        assert_eq!(wait_state(&queue, &record).await, JobState::Failed);
        let failed = queue.job(record.job_id).await.unwrap().unwrap();
        assert!(failed.message.unwrap().contains("job timeout"));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn lost_lease_abandons_the_run() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let store = InMemoryExperimentStore::new();
        let (tx, mut rx) = crate::completion::completion_channel();
        let record = enqueue(&queue, &store).await;

        let pool = pool(
            Arc::clone(&queue),
            store.clone(),
            Arc::new(Slow),
            QueueConfig::default().with_lease_ttl(0),
            Some(tx),
        );
        pool.spawn_workers(1).await;

        timeout(StdDuration::from_secs(5), async {
            while queue.job(record.job_id).await.unwrap().unwrap().state != JobState::Started {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("job was never leased");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(queue.scan_expired_leases().await.unwrap(), 1);

        // The evaluator sleeps far longer than this; only abandoning the run
        // frees the worker in time.
        timeout(StdDuration::from_secs(5), pool.shutdown())
            .await
            .expect("worker kept running after its lease was lost")
            .unwrap();

        let failed = queue.job(record.job_id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.message.as_deref(), Some(crate::queue::LEASE_EXPIRED_MESSAGE));
        assert_eq!(store.trial_count(record.experiment_id), 0);
        assert!(rx.drain().is_empty());
    }

    #[tokio::test]
    async fn idle_pool_shuts_down_promptly() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = pool(
            queue,
            InMemoryExperimentStore::new(),
            Arc::new(Sum),
            QueueConfig::default().with_housekeeper_interval(10),
            None,
        );
        pool.spawn_workers(3).await;
        pool.spawn_housekeeper();
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        let result = timeout(StdDuration::from_secs(5), pool.shutdown()).await;
        assert!(result.is_ok(), "shutdown did not complete within 5 seconds");
        assert!(pool.shutdown_token().is_cancelled());
    }
}
