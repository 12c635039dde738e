//! Durable job queue contract for the queue-backed worker backend.
//!
//! Each job carries one [`RunAssignment`]. Workers lease jobs, renew the
//! lease while the run executes, and complete the job with the run's
//! [`CompletionNotice`]. The queue's own job states are the source of truth
//! for liveness: nothing about a queued run is cached by the orchestrator.

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::RunAssignment;
use crate::completion::{CompletionNotice, TerminalStatus};
use crate::experiment::ExperimentId;
use crate::registry::{RunId, RunStatus};

mod memory;

pub use memory::InMemoryJobQueue;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a job lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_live(self) -> bool {
        matches!(self, JobState::Queued | JobState::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Started => "started",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "queued" => Ok(JobState::Queued),
            "started" => Ok(JobState::Started),
            "finished" => Ok(JobState::Finished),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(anyhow::anyhow!("invalid job state: {other}")),
        }
    }
}

impl From<TerminalStatus> for JobState {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Finished => JobState::Finished,
            TerminalStatus::Failed => JobState::Failed,
            TerminalStatus::Cancelled => JobState::Cancelled,
        }
    }
}

impl From<JobState> for RunStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => RunStatus::Queued,
            JobState::Started => RunStatus::Running,
            JobState::Finished => RunStatus::Finished,
            JobState::Failed => RunStatus::Failed,
            JobState::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// The queue's view of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub run_id: RunId,
    pub experiment_id: ExperimentId,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub trial_count: Option<u64>,
}

impl JobRecord {
    pub fn queued(job_id: JobId, assignment: &RunAssignment) -> Self {
        Self {
            job_id,
            run_id: assignment.run_id,
            experiment_id: assignment.snapshot.id(),
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            lease_expires_at: None,
            message: None,
            trial_count: None,
        }
    }
}

/// A job leased to a worker.
#[derive(Clone, Debug)]
pub struct JobLease {
    pub job_id: JobId,
    pub lease_id: LeaseId,
    pub assignment: RunAssignment,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl JobLease {
    pub fn new(
        job_id: JobId,
        assignment: RunAssignment,
        worker_id: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            job_id,
            lease_id: LeaseId::new(),
            assignment,
            worker_id: worker_id.into(),
            expires_at: Utc::now() + lease_ttl,
            renewals: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Request to extend a lease.
#[derive(Clone, Debug)]
pub struct LeaseRenewal {
    pub lease_id: LeaseId,
    pub worker_id: String,
    pub extend_by: Duration,
}

/// Trait for queue backends that hold run jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a run.
    async fn enqueue(&self, assignment: RunAssignment) -> anyhow::Result<JobRecord>;

    /// Lease the oldest queued job, if any.
    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> anyhow::Result<Option<JobLease>>;

    /// Extend a lease held by the requesting worker.
    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<JobLease>;

    /// Record a leased job's terminal outcome.
    async fn complete(&self, lease_id: LeaseId, notice: &CompletionNotice) -> anyhow::Result<()>;

    /// Current record of a job.
    async fn job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// Jobs that are queued or started.
    async fn live_jobs(&self) -> anyhow::Result<Vec<JobRecord>>;

    /// Cancel a job that has not started. Returns `false` for started or
    /// finished jobs, which cannot be interrupted.
    async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool>;

    /// Number of queued jobs.
    async fn queue_depth(&self) -> anyhow::Result<usize>;
}

/// Trait for marking jobs whose worker stopped renewing as failed.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Fail started jobs whose lease has expired. Returns how many.
    async fn scan_expired_leases(&self) -> anyhow::Result<u64>;
}

pub(crate) const LEASE_EXPIRED_MESSAGE: &str = "worker lease expired before the run reported completion";
