//! Queue backend integration tests.
//!
//! Runs are enqueued by an orchestrator and executed by a separate worker
//! pool sharing the same in-memory queue, as two processes would share a
//! PostgreSQL queue.

use std::sync::Arc;
use std::time::Duration;

use optrun::*;
use optrun_testkit::{seeded_store, single_param_spec, GatedEvaluator, MockEvaluator};
use serde_json::json;
use tokio::time::timeout;

fn worker_config() -> WorkerConfig {
    WorkerConfig::new("it")
        .with_poll_interval(5)
        .with_max_poll_attempts(4)
        .with_backoff(20)
}

async fn wait_for_status(orchestrator: &Orchestrator, id: ExperimentId, want: RunStatus) -> RunHandle {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Some(handle) = orchestrator.get_run_status(id).await {
                if handle.status == want {
                    return handle;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("run never reached {want:?}"))
}

#[tokio::test]
async fn worker_pool_drains_runs_submitted_through_the_orchestrator() {
    let (store, experiment) = seeded_store(single_param_spec("queued")).await;
    let queue = Arc::new(InMemoryJobQueue::new());
    let orchestrator = Orchestrator::builder()
        .with_store(store.clone())
        .with_backend(Arc::new(QueueBackend::new(Arc::clone(&queue))))
        .build()
        .unwrap();
    assert!(orchestrator.capabilities().authoritative_liveness);

    let response = orchestrator.submit_run(experiment.id, None).await.unwrap();
    assert_eq!(response.status, SubmitStatus::Submitted);
    assert_eq!(response.handle.unwrap().status, RunStatus::Queued);
    let again = orchestrator.submit_run(experiment.id, None).await.unwrap();
    assert_eq!(again.status, SubmitStatus::AlreadyRunning);
    assert_eq!(queue.queue_depth().await.unwrap(), 1);

    let evaluator = MockEvaluator::new();
    let pool = QueueWorkerPoolBuilder::new(QueueConfig::default())
        .with_queue(Arc::clone(&queue))
        .with_connector(store.clone())
        .with_evaluator(Arc::new(evaluator.clone()))
        .with_worker_config(worker_config())
        .build()
        .unwrap();
    pool.spawn_workers(2).await;

    let terminal = wait_for_status(&orchestrator, experiment.id, RunStatus::Finished).await;
    assert_eq!(terminal.trial_count, Some(4));
    assert_eq!(store.trial_count(experiment.id), 4);
    evaluator.assert_evaluation_count_eq(4);
    assert!(orchestrator.list_live_runs().await.unwrap().is_empty());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_runs_can_be_stopped_but_started_runs_cannot() {
    let (store, experiment) = seeded_store(single_param_spec("stoppable")).await;
    let queue = Arc::new(InMemoryJobQueue::new());
    let orchestrator = Orchestrator::builder()
        .with_store(store.clone())
        .with_backend(Arc::new(QueueBackend::new(Arc::clone(&queue))))
        .build()
        .unwrap();

    orchestrator.submit_run(experiment.id, None).await.unwrap();
    let stop = orchestrator.stop_run(experiment.id).await;
    assert!(stop.stopped, "{}", stop.message);
    assert_eq!(queue.queue_depth().await.unwrap(), 0);
    assert_eq!(orchestrator.reconcile().await, ReconcileReport::default());
    assert_eq!(orchestrator.registry().retired_count(), 0);

    orchestrator
        .submit_run(
            experiment.id,
            Some(json!({"type": "grid", "num_configs_per_param": 3})),
        )
        .await
        .unwrap();
    let evaluator = GatedEvaluator::new();
    let pool = QueueWorkerPoolBuilder::new(QueueConfig::default())
        .with_queue(Arc::clone(&queue))
        .with_connector(store.clone())
        .with_evaluator(Arc::new(evaluator.clone()))
        .with_worker_config(worker_config())
        .build()
        .unwrap();
    pool.spawn_workers(1).await;

    wait_for_status(&orchestrator, experiment.id, RunStatus::Running).await;
    let refused = orchestrator.stop_run(experiment.id).await;
    assert!(!refused.stopped);
    assert!(refused.message.contains("cannot interrupt"));

    evaluator.release(3);
    let terminal = wait_for_status(&orchestrator, experiment.id, RunStatus::Finished).await;
    assert_eq!(terminal.trial_count, Some(3));
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn repeated_queued_stops_leave_nothing_behind() {
    let (store, experiment) = seeded_store(single_param_spec("churn")).await;
    let queue = Arc::new(InMemoryJobQueue::new());
    let orchestrator = Orchestrator::builder()
        .with_store(store)
        .with_backend(Arc::new(QueueBackend::new(Arc::clone(&queue))))
        .build()
        .unwrap();

    for _ in 0..5 {
        let response = orchestrator.submit_run(experiment.id, None).await.unwrap();
        assert_eq!(response.status, SubmitStatus::Submitted);
        assert!(orchestrator.stop_run(experiment.id).await.stopped);
        orchestrator.reconcile().await;
    }

    let registry = orchestrator.registry();
    assert_eq!(registry.retired_count(), 0);
    assert_eq!(registry.live_count(), 0);
    assert_eq!(
        orchestrator.get_run_status(experiment.id).await.unwrap().status,
        RunStatus::Cancelled
    );
    assert!(queue.live_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_lease_fails_the_run_and_frees_the_experiment() {
    let (store, experiment) = seeded_store(single_param_spec("abandoned")).await;
    let queue = Arc::new(InMemoryJobQueue::new());
    let orchestrator = Orchestrator::builder()
        .with_store(store.clone())
        .with_backend(Arc::new(QueueBackend::new(Arc::clone(&queue))))
        .build()
        .unwrap();

    orchestrator.submit_run(experiment.id, None).await.unwrap();
    // A worker leases the job and disappears without renewing.
    let lease = queue
        .dequeue("vanished", chrono::Duration::milliseconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.assignment.experiment_id(), experiment.id);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = orchestrator.reconcile().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.removed, 1);

    let terminal = orchestrator.get_run_status(experiment.id).await.unwrap();
    assert_eq!(terminal.status, RunStatus::Failed);
    assert!(terminal.message.is_some());

    let retry = orchestrator.submit_run(experiment.id, None).await.unwrap();
    assert_eq!(retry.status, SubmitStatus::Submitted);
}
