use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::experiment::ExperimentId;
use crate::registry::{BackendRef, RunId, RunStatus};

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub experiment_id: ExperimentId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(experiment_id: ExperimentId, correlation_id: Option<Uuid>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            experiment_id,
            timestamp: Utc::now(),
        }
    }
}

/// Run lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    /// Build an event whose correlation id is the run id, so every event of
    /// one run can be grouped by subscribers.
    pub fn for_run(experiment_id: ExperimentId, run_id: RunId, payload: RunEventPayload) -> Self {
        Self {
            meta: EventMeta::new(experiment_id, Some(run_id.0)),
            payload,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// The backend confirmed start and the handle was attached.
    Submitted {
        run_id: RunId,
        optimizer: String,
        backend: BackendRef,
    },
    /// A completion notice removed the run from the registry.
    Completed {
        run_id: RunId,
        status: RunStatus,
        message: Option<String>,
        trial_count: u64,
    },
    /// The run was cancelled through `stop_run`.
    Stopped { run_id: RunId, message: String },
    /// A completion notice named a run other than the live one.
    ReconcileAnomaly { live_run: RunId, notice_run: RunId },
}

/// In-process event bus over a tokio broadcast channel.
///
/// Publishing never blocks; a subscriber that falls more than `capacity`
/// events behind receives `RecvError::Lagged` and resumes from the oldest
/// retained event.
#[derive(Clone)]
pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RunEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. Dropped silently when nobody is
    /// subscribed.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

/// Trait for subscribing to run lifecycle events.
pub trait RunEventStream: Send + Sync {
    fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent>;
}

impl RunEventStream for RunEventBus {
    fn subscribe_runs(&self) -> broadcast::Receiver<RunEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn stopped(experiment_id: ExperimentId) -> RunEvent {
        RunEvent::for_run(
            experiment_id,
            RunId::new(),
            RunEventPayload::Stopped {
                run_id: RunId::new(),
                message: "stopped".into(),
            },
        )
    }

    #[tokio::test]
    async fn events_fan_out_to_every_subscriber() {
        let bus = RunEventBus::new(16);
        let mut rx1 = bus.subscribe_runs();
        let mut rx2 = bus.subscribe_runs();
        let id = ExperimentId::new();

        for _ in 0..3 {
            bus.publish(stopped(id));
        }

        for _ in 0..3 {
            let a = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(a.meta.experiment_id, id);
            assert_eq!(b.meta.experiment_id, id);
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_publisher() {
        let bus = RunEventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(stopped(ExperimentId::new()));
        }
        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = RunEventBus::default();
        bus.publish(stopped(ExperimentId::new()));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(format!("{bus:?}").contains("capacity: 256"));
    }

    #[test]
    fn run_events_correlate_by_run_id() {
        let run = RunId::new();
        let event = RunEvent::for_run(
            ExperimentId::new(),
            run,
            RunEventPayload::ReconcileAnomaly {
                live_run: run,
                notice_run: RunId::new(),
            },
        );
        assert_eq!(event.meta.correlation_id, run.0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["event"], "reconcile_anomaly");
    }
}
