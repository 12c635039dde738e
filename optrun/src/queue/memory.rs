use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::backend::RunAssignment;
use crate::completion::CompletionNotice;
use crate::telemetry;

use super::{
    JobId, JobLease, JobQueue, JobRecord, JobState, LeaseExpiryScanner, LeaseId, LeaseRenewal,
    LEASE_EXPIRED_MESSAGE,
};

/// Process-local job queue. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobQueue {
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    jobs: HashMap<JobId, QueuedJob>,
}

#[derive(Debug, Clone)]
struct QueuedJob {
    record: JobRecord,
    assignment: RunAssignment,
    lease_id: Option<LeaseId>,
    renewals: u32,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn leased_mut<'a>(
        state: &'a mut QueueState,
        lease_id: LeaseId,
    ) -> anyhow::Result<&'a mut QueuedJob> {
        state
            .jobs
            .values_mut()
            .find(|job| job.lease_id == Some(lease_id) && job.record.state == JobState::Started)
            .ok_or_else(|| anyhow::anyhow!("lease not found: {lease_id}"))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, assignment: RunAssignment) -> anyhow::Result<JobRecord> {
        let job_id = JobId::new();
        let record = JobRecord::queued(job_id, &assignment);
        let mut state = self.inner.lock();
        state.ready.push_back(job_id);
        state.jobs.insert(
            job_id,
            QueuedJob {
                record: record.clone(),
                assignment,
                lease_id: None,
                renewals: 0,
            },
        );
        Ok(record)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> anyhow::Result<Option<JobLease>> {
        let mut state = self.inner.lock();
        while let Some(job_id) = state.ready.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.record.state != JobState::Queued {
                continue;
            }
            let lease = JobLease::new(job_id, job.assignment.clone(), worker_id, lease_ttl);
            job.lease_id = Some(lease.lease_id);
            job.renewals = 0;
            job.record.state = JobState::Started;
            job.record.started_at = Some(Utc::now());
            job.record.worker_id = Some(worker_id.to_string());
            job.record.lease_expires_at = Some(lease.expires_at);
            return Ok(Some(lease));
        }
        Ok(None)
    }

    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<JobLease> {
        let mut state = self.inner.lock();
        let job = Self::leased_mut(&mut state, renewal.lease_id)?;
        if job.record.worker_id.as_deref() != Some(renewal.worker_id.as_str()) {
            anyhow::bail!("lease {} is held by another worker", renewal.lease_id);
        }
        let expires_at = Utc::now() + renewal.extend_by;
        job.record.lease_expires_at = Some(expires_at);
        job.renewals += 1;
        Ok(JobLease {
            job_id: job.record.job_id,
            lease_id: renewal.lease_id,
            assignment: job.assignment.clone(),
            worker_id: renewal.worker_id,
            expires_at,
            renewals: job.renewals,
        })
    }

    async fn complete(&self, lease_id: LeaseId, notice: &CompletionNotice) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        let job = Self::leased_mut(&mut state, lease_id)?;
        job.record.state = notice.status.into();
        job.record.finished_at = Some(notice.finished_at);
        job.record.message = notice.message.clone();
        job.record.trial_count = Some(notice.trial_count);
        job.record.lease_expires_at = None;
        job.lease_id = None;
        Ok(())
    }

    async fn job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .get(&job_id)
            .map(|job| job.record.clone()))
    }

    async fn live_jobs(&self) -> anyhow::Result<Vec<JobRecord>> {
        let state = self.inner.lock();
        let mut live: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.record.state.is_live())
            .map(|job| job.record.clone())
            .collect();
        live.sort_by_key(|record| record.enqueued_at);
        Ok(live)
    }

    async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool> {
        let mut state = self.inner.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.record.state != JobState::Queued {
            return Ok(false);
        }
        job.record.state = JobState::Cancelled;
        job.record.finished_at = Some(Utc::now());
        job.record.message = Some("cancelled before a worker picked it up".into());
        state.ready.retain(|id| *id != job_id);
        Ok(true)
    }

    async fn queue_depth(&self) -> anyhow::Result<usize> {
        let state = self.inner.lock();
        Ok(state
            .ready
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(id)
                    .is_some_and(|job| job.record.state == JobState::Queued)
            })
            .count())
    }
}

#[async_trait]
impl LeaseExpiryScanner for InMemoryJobQueue {
    async fn scan_expired_leases(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let mut expired = 0;
        for job in state.jobs.values_mut() {
            let lapsed = job.record.state == JobState::Started
                && job.record.lease_expires_at.is_some_and(|at| at < now);
            if !lapsed {
                continue;
            }
            telemetry::record_lease_expired(
                job.record.experiment_id.to_string(),
                job.record.job_id.to_string(),
            );
            job.record.state = JobState::Failed;
            job.record.finished_at = Some(now);
            job.record.message = Some(LEASE_EXPIRED_MESSAGE.to_string());
            job.record.lease_expires_at = None;
            job.lease_id = None;
            expired += 1;
        }
        Ok(expired)
    }
}
