use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::completion::CompletionSender;
use crate::config::QueueConfig;
use crate::executor::TrialEvaluator;
use crate::queue::{JobQueue, LeaseExpiryScanner};
use crate::store::StoreConnector;

use super::pool::QueueWorkerPool;
use super::worker::WorkerConfig;

/// Builder for constructing a `QueueWorkerPool` with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the pool. Each dependency is configured via a `with_*` method.
///
/// # Example
///
/// ```ignore
/// use optrun::*;
///
/// let pool = QueueWorkerPoolBuilder::new(QueueConfig::default())
///     .with_queue(queue)
///     .with_connector(connector)
///     .with_evaluator(Arc::new(CommandEvaluator::new()))
///     .build()?;
/// pool.spawn_workers(4).await;
/// pool.spawn_housekeeper();
/// ```
pub struct QueueWorkerPoolBuilder<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    queue_config: QueueConfig,
    worker_config: WorkerConfig,
    queue: Option<Arc<Q>>,
    connector: Option<Arc<dyn StoreConnector>>,
    evaluator: Option<Arc<dyn TrialEvaluator>>,
    completions: Option<CompletionSender>,
}

impl<Q> fmt::Debug for QueueWorkerPoolBuilder<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("QueueWorkerPoolBuilder");
        debug.field("queue_config", &self.queue_config);
        debug.field("worker_config", &self.worker_config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("connector_set", &self.connector.is_some());
        debug.field("evaluator_set", &self.evaluator.is_some());
        debug.field("completions_set", &self.completions.is_some());

        if self.queue.is_some() {
            debug.field("queue_type", &type_name::<Q>());
        }

        debug.finish()
    }
}

impl<Q> QueueWorkerPoolBuilder<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    /// Create a new builder with the given queue configuration.
    pub fn new(queue_config: QueueConfig) -> Self {
        Self {
            queue_config,
            worker_config: WorkerConfig::default(),
            queue: None,
            connector: None,
            evaluator: None,
            completions: None,
        }
    }

    /// Set the job queue.
    pub fn with_queue(mut self, queue: Arc<Q>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the connector each run executor opens its store session with.
    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the trial evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn TrialEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_worker_config(mut self, worker_config: WorkerConfig) -> Self {
        self.worker_config = worker_config;
        self
    }

    /// Also forward every completion notice to an in-process orchestrator.
    pub fn with_completions(mut self, completions: CompletionSender) -> Self {
        self.completions = Some(completions);
        self
    }

    /// Build the `QueueWorkerPool` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<QueueWorkerPool<Q>> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let connector = self
            .connector
            .ok_or_else(|| anyhow::anyhow!("connector dependency missing"))?;
        let evaluator = self
            .evaluator
            .ok_or_else(|| anyhow::anyhow!("evaluator dependency missing"))?;
        if self.queue_config.lease_ttl_secs <= 0 {
            anyhow::bail!(
                "lease_ttl_secs must be positive, got {}",
                self.queue_config.lease_ttl_secs
            );
        }

        Ok(QueueWorkerPool::new(
            queue,
            connector,
            evaluator,
            self.queue_config,
            self.worker_config,
            self.completions,
        ))
    }
}
