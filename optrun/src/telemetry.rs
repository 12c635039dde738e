//! Tracing and telemetry instrumentation for optrun.
//!
//! Span constructors for the run lifecycle (dispatch, execution, trial
//! evaluation, queue dequeue) and `record_*` helpers that log an event and,
//! with the `metrics` feature, update the matching Prometheus series. Every
//! helper works with and without the feature.

use std::future::Future;
use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `default_directive`. Stdout stays free for worker protocol output.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}

/// Span covering one submission through the dispatcher.
#[must_use]
pub fn run_dispatch_span(experiment_id: impl AsRef<str>, optimizer: impl AsRef<str>) -> Span {
    info_span!(
        "optrun.dispatch",
        experiment_id = %experiment_id.as_ref(),
        optimizer = %optimizer.as_ref(),
    )
}

/// Span covering one run executor from initialization to its terminal state.
///
/// # Arguments
/// * `run_id` - The run identifier
/// * `experiment_id` - The experiment being optimized
#[must_use]
pub fn run_execute_span(run_id: impl AsRef<str>, experiment_id: impl AsRef<str>) -> Span {
    info_span!(
        "optrun.execute",
        run_id = %run_id.as_ref(),
        experiment_id = %experiment_id.as_ref(),
    )
}

/// Span covering the evaluation of a single configuration.
#[must_use]
pub fn trial_span(run_id: impl AsRef<str>, index: u64) -> Span {
    info_span!("optrun.trial", run_id = %run_id.as_ref(), index = index)
}

#[must_use]
pub fn queue_dequeue_span(worker_id: impl AsRef<str>, queue: impl AsRef<str>) -> Span {
    info_span!(
        "optrun.dequeue",
        worker_id = %worker_id.as_ref(),
        queue = %queue.as_ref(),
    )
}

/// Instrument a run executor future with its execution span.
pub fn instrument_run<F>(
    run_id: impl AsRef<str>,
    experiment_id: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(run_execute_span(run_id, experiment_id))
}

/// Record an accepted submission.
pub fn record_run_submitted(experiment_id: impl AsRef<str>, optimizer: impl AsRef<str>) {
    tracing::info!(
        experiment_id = %experiment_id.as_ref(),
        optimizer = %optimizer.as_ref(),
        "run submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_submitted(optimizer.as_ref());
}

/// Record a submission that was turned away.
///
/// # Arguments
/// * `experiment_id` - The experiment the caller asked to run
/// * `reason` - One of `already_running`, `invalid_config`, `not_found`,
///   `backend_unavailable`
pub fn record_run_rejected(experiment_id: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::info!(
        experiment_id = %experiment_id.as_ref(),
        reason = %reason.as_ref(),
        "run rejected"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_rejected(reason.as_ref());
}

/// Record a run leaving the registry with a terminal status.
pub fn record_run_completed(
    experiment_id: impl AsRef<str>,
    run_id: impl AsRef<str>,
    status: impl AsRef<str>,
    trial_count: u64,
) {
    tracing::info!(
        experiment_id = %experiment_id.as_ref(),
        run_id = %run_id.as_ref(),
        status = %status.as_ref(),
        trial_count = trial_count,
        "run completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_completed(status.as_ref());
}

/// Record a persisted trial and how long its evaluation took.
pub fn record_trial(experiment_id: impl AsRef<str>, score: f64, duration_secs: f64) {
    tracing::debug!(
        experiment_id = %experiment_id.as_ref(),
        score = score,
        duration_secs = duration_secs,
        "trial recorded"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_trial_duration(duration_secs);
}

/// Record a trial that was evaluated but could not be persisted.
pub fn record_persistence_warning(experiment_id: impl AsRef<str>, error: impl AsRef<str>) {
    tracing::warn!(
        experiment_id = %experiment_id.as_ref(),
        error = %error.as_ref(),
        "trial could not be persisted; continuing run"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_persistence_warning();
}

/// Record a completion notice that named a different run than the live one.
pub fn record_reconcile_anomaly(
    experiment_id: impl AsRef<str>,
    live_run: impl AsRef<str>,
    notice_run: impl AsRef<str>,
) {
    tracing::error!(
        experiment_id = %experiment_id.as_ref(),
        live_run = %live_run.as_ref(),
        notice_run = %notice_run.as_ref(),
        "completion notice does not match the live run"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_reconcile_anomaly();
}

/// Record a queue job whose worker stopped renewing its lease.
pub fn record_lease_expired(experiment_id: impl AsRef<str>, job_id: impl AsRef<str>) {
    tracing::warn!(
        experiment_id = %experiment_id.as_ref(),
        job_id = %job_id.as_ref(),
        "lease expired"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_expired();
}

/// Update the live-run gauge.
pub fn set_live_runs(count: usize) {
    tracing::debug!(live_runs = count, "live runs updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_live_runs(count as f64);
}

/// Start timing a trial evaluation.
pub fn start_trial_timer(index: u64) -> TrialTimer {
    TrialTimer {
        index,
        start: std::time::Instant::now(),
    }
}

/// Opaque timer returned by [`start_trial_timer`].
#[derive(Debug)]
pub struct TrialTimer {
    index: u64,
    start: std::time::Instant,
}

impl TrialTimer {
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_timer_measures_elapsed_time() {
        let timer = start_trial_timer(7);
        assert_eq!(timer.index(), 7);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.elapsed_secs() > 0.0);
    }

    #[tokio::test]
    async fn instrumented_future_yields_its_output() {
        let value = instrument_run("run-1", "exp-1", async { 41 + 1 }).await;
        assert_eq!(value, 42);
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_run_submitted("exp", "bayesopt");
        record_run_rejected("exp", "already_running");
        record_run_completed("exp", "run", "finished", 4);
        record_trial("exp", 0.5, 0.01);
        record_persistence_warning("exp", "disk full");
        record_reconcile_anomaly("exp", "a", "b");
        record_lease_expired("exp", "job");
        set_live_runs(3);
        let _span = trial_span("run", 0).entered();
    }
}
