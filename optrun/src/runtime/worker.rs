use serde::{Deserialize, Serialize};

/// Configuration for the workers of a [`super::QueueWorkerPool`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Prefix of each worker's id; workers are named `{worker_id}-w{n}`.
    pub worker_id: String,
    /// Polling interval when no work is available, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive empty polls before a worker switches to `backoff_ms`.
    pub max_poll_attempts: u32,
    /// Sleep after a dequeue error or a long idle stretch, in milliseconds.
    pub backoff_ms: u64,
    /// Fraction of the lease TTL left when a renewal is attempted.
    pub renew_at_fraction: f32,
    /// Renew no later than this many seconds before the lease expires.
    pub renew_min_margin_secs: u64,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the maximum poll attempts.
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Set the backoff duration.
    pub fn with_backoff(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    pub fn with_renew_at_fraction(mut self, fraction: f32) -> Self {
        self.renew_at_fraction = fraction.clamp(0.05, 0.95);
        self
    }

    /// Sleep before the next dequeue after `idle_polls` consecutive empty
    /// polls.
    pub fn idle_delay(&self, idle_polls: u32) -> std::time::Duration {
        if idle_polls > self.max_poll_attempts {
            std::time::Duration::from_millis(self.backoff_ms)
        } else {
            std::time::Duration::from_millis(self.poll_interval_ms)
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("optrun-{}", std::process::id()),
            poll_interval_ms: 50,
            max_poll_attempts: 10,
            backoff_ms: 500,
            renew_at_fraction: 0.5,
            renew_min_margin_secs: 2,
        }
    }
}
