//! Prometheus metrics for optrun.
//!
//! All metrics are compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `optrun_runs_submitted_total` - Accepted submissions, by optimizer
//! - `optrun_runs_rejected_total` - Rejected submissions, by reason
//! - `optrun_runs_completed_total` - Runs reconciled out of the registry, by status
//! - `optrun_persistence_warnings_total` - Trials that failed to persist
//! - `optrun_reconcile_anomalies_total` - Notices that did not match the live run
//! - `optrun_lease_expired_total` - Queue jobs failed by lease expiry
//!
//! ## Gauges
//! - `optrun_live_runs` - Runs currently in the registry
//!
//! ## Histograms
//! - `optrun_trial_duration_seconds` - Wall time of one trial evaluation
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, Counter, CounterVec, Gauge, Histogram, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for optrun metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RUNS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("optrun_runs_submitted_total", "Accepted run submissions");
    CounterVec::new(opts, &["optimizer"]).expect("optrun_runs_submitted_total metric creation failed")
});

pub static RUNS_REJECTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("optrun_runs_rejected_total", "Rejected run submissions");
    CounterVec::new(opts, &["reason"]).expect("optrun_runs_rejected_total metric creation failed")
});

/// Labels:
/// - `status`: finished, failed or cancelled
pub static RUNS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "optrun_runs_completed_total",
        "Runs removed from the registry with a terminal status",
    );
    CounterVec::new(opts, &["status"]).expect("optrun_runs_completed_total metric creation failed")
});

pub static PERSISTENCE_WARNINGS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "optrun_persistence_warnings_total",
        "Trials evaluated but not persisted",
    )
    .expect("optrun_persistence_warnings_total metric creation failed")
});

pub static RECONCILE_ANOMALIES_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "optrun_reconcile_anomalies_total",
        "Completion notices naming a run other than the live one",
    )
    .expect("optrun_reconcile_anomalies_total metric creation failed")
});

pub static LEASE_EXPIRED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("optrun_lease_expired_total", "Queue jobs failed by lease expiry")
        .expect("optrun_lease_expired_total metric creation failed")
});

pub static LIVE_RUNS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("optrun_live_runs", "Runs currently held by the registry")
        .expect("optrun_live_runs metric creation failed")
});

/// Trial evaluations range from sub-second commands to hour-long jobs.
pub static TRIAL_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 3.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "optrun_trial_duration_seconds",
        "Wall time of one trial evaluation in seconds",
    )
    .buckets(buckets);
    Histogram::with_opts(opts).expect("optrun_trial_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_REJECTED_TOTAL.clone()),
        Box::new(RUNS_COMPLETED_TOTAL.clone()),
        Box::new(PERSISTENCE_WARNINGS_TOTAL.clone()),
        Box::new(RECONCILE_ANOMALIES_TOTAL.clone()),
        Box::new(LEASE_EXPIRED_TOTAL.clone()),
        Box::new(LIVE_RUNS.clone()),
        Box::new(TRIAL_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_run_submitted(optimizer: &str) {
    RUNS_SUBMITTED_TOTAL.with_label_values(&[optimizer]).inc();
}

pub fn record_run_rejected(reason: &str) {
    RUNS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_run_completed(status: &str) {
    RUNS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_persistence_warning() {
    PERSISTENCE_WARNINGS_TOTAL.inc();
}

pub fn record_reconcile_anomaly() {
    RECONCILE_ANOMALIES_TOTAL.inc();
}

pub fn record_lease_expired() {
    LEASE_EXPIRED_TOTAL.inc();
}

pub fn set_live_runs(count: f64) {
    LIVE_RUNS.set(count);
}

pub fn observe_trial_duration(duration_secs: f64) {
    TRIAL_DURATION_SECONDS.observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
