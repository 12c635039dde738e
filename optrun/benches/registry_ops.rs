//! Benchmarks for the run registry and the in-memory job queue.
//!
//! - Reserve, attach and complete one run
//! - Reservation contention across many experiments
//! - Queue lifecycle (enqueue → dequeue → complete)
//! - Run assignment encode/decode, the payload handed to workers

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::Duration;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use optrun::*;
use optrun_testkit::{single_param_spec, spec_with_params};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn live_handle(experiment_id: ExperimentId) -> RunHandle {
    let run_id = RunId::new();
    RunHandle::new(
        run_id,
        experiment_id,
        RunStatus::Running,
        BackendRef::Task {
            task_id: run_id.to_string(),
        },
    )
}

/// Benchmark: one full registry cycle for a single experiment.
fn bench_registry_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_cycle");
    group.sample_size(100);

    group.bench_function("reserve_attach_complete", |b| {
        let registry = RunRegistry::new();
        let experiment_id = ExperimentId::new();

        b.iter(|| {
            let reservation = registry
                .reserve(experiment_id)
                .expect("slot is free between iterations");
            let handle = live_handle(experiment_id);
            let run_id = handle.run_id;
            reservation.attach(handle).expect("attach should succeed");
            let notice = CompletionNotice::new(
                run_id,
                experiment_id,
                TerminalStatus::Finished,
                None,
                4,
            );
            registry.apply_completion(&notice)
        });
    });

    group.finish();
}

/// Benchmark: reservations spread over `n` experiments from concurrent tasks.
fn bench_reserve_contention(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("reserve_contention");
    group.sample_size(30);

    for experiments in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(
            BenchmarkId::new("tasks_256", experiments),
            &experiments,
            |b, &n| {
                let ids: Vec<ExperimentId> = (0..n).map(|_| ExperimentId::new()).collect();
                b.to_async(&rt).iter(|| {
                    let ids = ids.clone();
                    async move {
                        let registry = Arc::new(RunRegistry::new());
                        let tasks: Vec<_> = (0..256)
                            .map(|i| {
                                let registry = Arc::clone(&registry);
                                let id = ids[i % ids.len()];
                                tokio::spawn(async move { registry.try_reserve(id) })
                            })
                            .collect();
                        let mut won = 0;
                        for task in tasks {
                            if task.await.unwrap_or(false) {
                                won += 1;
                            }
                        }
                        assert_eq!(won, ids.len());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: enqueue, lease and complete one job.
fn bench_queue_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();
    let experiment = Experiment::from_spec(ExperimentId::new(), single_param_spec("bench"));

    let mut group = c.benchmark_group("queue_lifecycle");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let queue = Arc::new(InMemoryJobQueue::new());
        b.to_async(&rt).iter(|| {
            let queue = Arc::clone(&queue);
            let assignment =
                RunAssignment::new(RunId::new(), experiment.snapshot(), OptimizerSpec::default());
            async move {
                let record = queue.enqueue(assignment).await.expect("enqueue");
                let lease = queue
                    .dequeue("bench", Duration::seconds(30))
                    .await
                    .expect("dequeue")
                    .expect("job is ready");
                let notice = CompletionNotice::new(
                    record.run_id,
                    record.experiment_id,
                    TerminalStatus::Finished,
                    None,
                    0,
                );
                queue.complete(lease.lease_id, &notice).await.expect("complete");
            }
        });
    });

    group.finish();
}

/// Benchmark: assignment JSON round trip as parameter count grows.
fn bench_assignment_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("assignment_codec");

    for params in [1usize, 8, 64] {
        let names: Vec<String> = (0..params).map(|i| format!("p{i}")).collect();
        let bounds: Vec<(&str, f64, f64)> =
            names.iter().map(|n| (n.as_str(), 0.0, 1.0)).collect();
        let experiment =
            Experiment::from_spec(ExperimentId::new(), spec_with_params("codec", &bounds));
        let assignment =
            RunAssignment::new(RunId::new(), experiment.snapshot(), OptimizerSpec::default());

        group.bench_with_input(BenchmarkId::new("json", params), &assignment, |b, a| {
            b.iter(|| {
                let bytes = serde_json::to_vec(a).expect("encode");
                let decoded: RunAssignment = serde_json::from_slice(&bytes).expect("decode");
                decoded
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_registry_cycle,
    bench_reserve_contention,
    bench_queue_lifecycle,
    bench_assignment_codec
);
criterion_main!(benches);
