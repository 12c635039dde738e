use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::RunAssignment;
use crate::completion::CompletionNotice;
use crate::config::PersistenceConfig;
use crate::experiment::{Compute, Experiment, ExperimentId, ExperimentSpec, Parameter};
use crate::queue::{
    JobId, JobLease, JobQueue, JobRecord, JobState, LeaseExpiryScanner, LeaseId, LeaseRenewal,
    LEASE_EXPIRED_MESSAGE,
};
use crate::registry::RunId;
use crate::store::{ExperimentStore, StoreConnector};
use crate::telemetry;
use crate::trial::{Configuration, Trial};

const UNIQUE_VIOLATION: &str = "23505";

/// Open a connection pool sized by `config`.
pub async fn connect_pool(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(StdDuration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

/// Create the experiment, trial and job tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(include_str!("../../migrations/001_initial_schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().map(|c| c.to_string()).as_deref() == Some(UNIQUE_VIOLATION)
        }
        _ => false,
    }
}

/// PostgreSQL-backed experiment and trial store.
#[derive(Clone, Debug)]
pub struct PostgresExperimentStore {
    pool: PgPool,
}

impl PostgresExperimentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn experiment_from_row(row: &PgRow) -> anyhow::Result<Experiment> {
        let parameters: Vec<Parameter> = serde_json::from_value(row.try_get("parameters")?)?;
        let compute: Compute = serde_json::from_value(row.try_get("compute")?)?;
        Ok(Experiment {
            id: ExperimentId(row.try_get("id")?),
            tool_name: row.try_get("tool_name")?,
            parameters,
            command_template_string: row.try_get("command_template")?,
            compute,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn find_by_identity(&self, identity_key: &str) -> anyhow::Result<Option<Experiment>> {
        let row = sqlx::query(
            r#"
            SELECT id, tool_name, parameters, command_template, compute, created_at
            FROM optrun_experiments
            WHERE identity_key = $1
            "#,
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::experiment_from_row).transpose()
    }
}

#[async_trait]
impl ExperimentStore for PostgresExperimentStore {
    async fn get_experiment(&self, id: ExperimentId) -> anyhow::Result<Option<Experiment>> {
        let row = sqlx::query(
            r#"
            SELECT id, tool_name, parameters, command_template, compute, created_at
            FROM optrun_experiments
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::experiment_from_row).transpose()
    }

    async fn get_or_create_experiment(
        &self,
        spec: ExperimentSpec,
    ) -> anyhow::Result<(Experiment, bool)> {
        let identity_key = spec.identity_key();
        if let Some(existing) = self.find_by_identity(&identity_key).await? {
            return Ok((existing, false));
        }

        let experiment = Experiment::from_spec(ExperimentId::new(), spec);
        let inserted = sqlx::query(
            r#"
            INSERT INTO optrun_experiments (
                id, identity_key, tool_name, parameters, command_template, compute, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (identity_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(experiment.id.0)
        .bind(&identity_key)
        .bind(&experiment.tool_name)
        .bind(serde_json::to_value(&experiment.parameters)?)
        .bind(&experiment.command_template_string)
        .bind(serde_json::to_value(&experiment.compute)?)
        .bind(experiment.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            debug!(experiment_id = %experiment.id, "created experiment");
            return Ok((experiment, true));
        }

        // Lost the race to a concurrent create of the same identity.
        let winner = self
            .find_by_identity(&identity_key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("experiment insert conflicted but no row was found"))?;
        Ok((winner, false))
    }

    async fn list_trials(&self, id: ExperimentId) -> anyhow::Result<Vec<Trial>> {
        let rows = sqlx::query(
            r#"
            SELECT id, configuration, score, recorded_at
            FROM optrun_trials
            WHERE experiment_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let configuration: Configuration =
                    serde_json::from_value(row.try_get("configuration")?)?;
                Ok(Trial {
                    trial_id: Some(row.try_get("id")?),
                    experiment_id: id,
                    configuration,
                    score: row.try_get("score")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn append_trial(&self, mut trial: Trial) -> anyhow::Result<Trial> {
        let row = sqlx::query(
            r#"
            INSERT INTO optrun_trials (experiment_id, configuration, score, recorded_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(trial.experiment_id.0)
        .bind(serde_json::to_value(&trial.configuration)?)
        .bind(trial.score)
        .bind(trial.recorded_at)
        .fetch_one(&self.pool)
        .await?;
        trial.trial_id = Some(row.try_get("id")?);
        Ok(trial)
    }
}

/// Opens a fresh pool per run executor so no connection crosses a worker
/// boundary.
#[derive(Clone, Debug)]
pub struct PostgresConnector {
    config: PersistenceConfig,
}

impl PostgresConnector {
    pub fn new(config: PersistenceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for PostgresConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn ExperimentStore>> {
        let pool = connect_pool(&self.config).await?;
        Ok(Arc::new(PostgresExperimentStore::new(pool)))
    }
}

/// PostgreSQL-backed run queue.
///
/// Leasing uses `FOR UPDATE SKIP LOCKED`, so any number of worker pools can
/// share one queue. A partial unique index keeps at most one live job per
/// experiment even across orchestrator instances.
#[derive(Clone, Debug)]
pub struct PostgresJobQueue {
    pool: PgPool,
    queue_name: String,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn record_from_row(row: &PgRow) -> anyhow::Result<JobRecord> {
        let state: String = row.try_get("state")?;
        let trial_count: Option<i64> = row.try_get("trial_count")?;
        Ok(JobRecord {
            job_id: JobId(row.try_get("id")?),
            run_id: RunId(row.try_get("run_id")?),
            experiment_id: ExperimentId(row.try_get("experiment_id")?),
            state: JobState::parse(&state)?,
            enqueued_at: row.try_get("enqueued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            worker_id: row.try_get("worker_id")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            message: row.try_get("message")?,
            trial_count: trial_count.map(|count| count.max(0) as u64),
        })
    }
}

const RECORD_COLUMNS: &str = "id, run_id, experiment_id, state, enqueued_at, started_at, \
     finished_at, worker_id, lease_expires_at, message, trial_count";

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, assignment: RunAssignment) -> anyhow::Result<JobRecord> {
        let job_id = JobId::new();
        let record = JobRecord::queued(job_id, &assignment);
        let payload = serde_json::to_value(&assignment)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO optrun_jobs (
                id, queue_name, run_id, experiment_id, payload, state, enqueued_at
            )
            VALUES ($1, $2, $3, $4, $5, 'queued', $6)
            "#,
        )
        .bind(job_id.0)
        .bind(&self.queue_name)
        .bind(record.run_id.0)
        .bind(record.experiment_id.0)
        .bind(&payload)
        .bind(record.enqueued_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(record),
            Err(err) if is_unique_violation(&err) => Err(anyhow::anyhow!(
                "experiment {} already has a live job on queue {}",
                record.experiment_id,
                self.queue_name
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> anyhow::Result<Option<JobLease>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM optrun_jobs
                WHERE queue_name = $1
                  AND state = 'queued'
                ORDER BY enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            SELECT j.id, j.payload
            FROM optrun_jobs j
            JOIN next ON next.id = j.id
            "#,
        )
        .bind(&self.queue_name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            drop(tx);
            return Ok(None);
        };

        let job_id = JobId(row.try_get("id")?);
        let assignment: RunAssignment = serde_json::from_value(row.try_get("payload")?)?;
        let lease = JobLease::new(job_id, assignment, worker_id, lease_ttl);

        let updated = sqlx::query(
            r#"
            UPDATE optrun_jobs
            SET state = 'started',
                started_at = NOW(),
                worker_id = $1,
                lease_id = $2,
                lease_expires_at = $3,
                renewals = 0
            WHERE id = $4
              AND queue_name = $5
              AND state = 'queued'
            RETURNING lease_id
            "#,
        )
        .bind(worker_id)
        .bind(lease.lease_id.0)
        .bind(lease.expires_at)
        .bind(job_id.0)
        .bind(&self.queue_name)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            drop(tx);
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(lease))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<JobLease> {
        let extend_ms = renewal.extend_by.num_milliseconds();
        let row = sqlx::query(
            r#"
            UPDATE optrun_jobs
            SET lease_expires_at = NOW() + ($1::bigint) * INTERVAL '1 millisecond',
                renewals = renewals + 1
            WHERE lease_id = $2
              AND queue_name = $3
              AND worker_id = $4
              AND state = 'started'
              AND lease_expires_at > NOW()
            RETURNING id, payload, lease_expires_at, renewals
            "#,
        )
        .bind(extend_ms)
        .bind(renewal.lease_id.0)
        .bind(&self.queue_name)
        .bind(&renewal.worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            warn!(lease_id = %renewal.lease_id, "renewal failed: lease not found, expired, or held by another worker");
            return Err(anyhow::anyhow!("lease not found or expired: {}", renewal.lease_id));
        };

        let assignment: RunAssignment = serde_json::from_value(row.try_get("payload")?)?;
        let expires_at: DateTime<Utc> = row.try_get("lease_expires_at")?;
        let renewals: i32 = row.try_get("renewals")?;
        let lease = JobLease {
            job_id: JobId(row.try_get("id")?),
            lease_id: renewal.lease_id,
            assignment,
            worker_id: renewal.worker_id,
            expires_at,
            renewals: renewals.max(0) as u32,
        };
        debug!(lease_id = %lease.lease_id, expires_at = %lease.expires_at, "renewed lease");
        Ok(lease)
    }

    async fn complete(&self, lease_id: LeaseId, notice: &CompletionNotice) -> anyhow::Result<()> {
        let state = JobState::from(notice.status);
        let res = sqlx::query(
            r#"
            UPDATE optrun_jobs
            SET state = $1,
                finished_at = $2,
                message = $3,
                trial_count = $4,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE lease_id = $5
              AND queue_name = $6
              AND state = 'started'
            "#,
        )
        .bind(state.as_str())
        .bind(notice.finished_at)
        .bind(&notice.message)
        .bind(i64::try_from(notice.trial_count).unwrap_or(i64::MAX))
        .bind(lease_id.0)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(anyhow::anyhow!("lease not found: {lease_id}"));
        }
        debug!(%lease_id, state = state.as_str(), "completed job");
        Ok(())
    }

    async fn job(&self, job_id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM optrun_jobs WHERE id = $1 AND queue_name = $2"
        ))
        .bind(job_id.0)
        .bind(&self.queue_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn live_jobs(&self) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM optrun_jobs \
             WHERE queue_name = $1 AND state IN ('queued', 'started') \
             ORDER BY enqueued_at ASC"
        ))
        .bind(&self.queue_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE optrun_jobs
            SET state = 'cancelled',
                finished_at = NOW(),
                message = 'cancelled before a worker picked it up'
            WHERE id = $1
              AND queue_name = $2
              AND state = 'queued'
            "#,
        )
        .bind(job_id.0)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn queue_depth(&self) -> anyhow::Result<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::bigint AS count
            FROM optrun_jobs
            WHERE queue_name = $1
              AND state = 'queued'
            "#,
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresJobQueue {
    async fn scan_expired_leases(&self) -> anyhow::Result<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE optrun_jobs
            SET state = 'failed',
                finished_at = NOW(),
                message = $1,
                lease_id = NULL,
                lease_expires_at = NULL
            WHERE queue_name = $2
              AND state = 'started'
              AND lease_expires_at < NOW()
            RETURNING id, experiment_id
            "#,
        )
        .bind(LEASE_EXPIRED_MESSAGE)
        .bind(&self.queue_name)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let job_id: Uuid = row.try_get("id")?;
            let experiment_id: Uuid = row.try_get("experiment_id")?;
            telemetry::record_lease_expired(experiment_id.to_string(), job_id.to_string());
        }
        Ok(rows.len() as u64)
    }
}
