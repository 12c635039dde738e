use std::sync::Arc;

use async_trait::async_trait;
use optrun::*;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Records every evaluation and scores it as the sum of squared values.
#[derive(Clone, Default)]
pub struct MockEvaluator {
    evaluations: Arc<Mutex<Vec<EvaluationRecord>>>,
}

#[derive(Clone, Debug)]
pub struct EvaluationRecord {
    pub experiment_id: ExperimentId,
    pub configuration: Configuration,
    pub score: f64,
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> Vec<EvaluationRecord> {
        self.evaluations.lock().clone()
    }

    pub fn assert_evaluation_count_eq(&self, expected: usize) {
        let actual = self.evaluations.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} evaluations, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.evaluations.lock().clear();
    }
}

#[async_trait]
impl TrialEvaluator for MockEvaluator {
    async fn evaluate(
        &self,
        snapshot: &ExperimentSnapshot,
        configuration: &Configuration,
    ) -> anyhow::Result<f64> {
        let score = configuration.values().map(|v| v * v).sum();
        self.evaluations.lock().push(EvaluationRecord {
            experiment_id: snapshot.id(),
            configuration: configuration.clone(),
            score,
        });
        Ok(score)
    }
}

/// Blocks each evaluation until a permit is released, so tests can hold a
/// run in the live state for as long as they need.
#[derive(Clone)]
pub struct GatedEvaluator {
    gate: Arc<Semaphore>,
    inner: MockEvaluator,
}

impl GatedEvaluator {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            inner: MockEvaluator::new(),
        }
    }

    /// Let `n` more evaluations through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn evaluations(&self) -> &MockEvaluator {
        &self.inner
    }
}

impl Default for GatedEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrialEvaluator for GatedEvaluator {
    async fn evaluate(
        &self,
        snapshot: &ExperimentSnapshot,
        configuration: &Configuration,
    ) -> anyhow::Result<f64> {
        let permit = self.gate.acquire().await?;
        permit.forget();
        self.inner.evaluate(snapshot, configuration).await
    }
}

/// Succeeds `succeed_first` times, then fails every evaluation.
#[derive(Clone)]
pub struct FailingEvaluator {
    succeed_first: usize,
    calls: Arc<Mutex<usize>>,
    error: String,
}

impl FailingEvaluator {
    pub fn new(error: impl Into<String>) -> Self {
        Self::after(0, error)
    }

    pub fn after(succeed_first: usize, error: impl Into<String>) -> Self {
        Self {
            succeed_first,
            calls: Arc::new(Mutex::new(0)),
            error: error.into(),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl TrialEvaluator for FailingEvaluator {
    async fn evaluate(
        &self,
        _snapshot: &ExperimentSnapshot,
        _configuration: &Configuration,
    ) -> anyhow::Result<f64> {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if call > self.succeed_first {
            anyhow::bail!("{}", self.error);
        }
        Ok(call as f64)
    }
}
