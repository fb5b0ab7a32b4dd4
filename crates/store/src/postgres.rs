//! Postgres-backed store.
//!
//! All selection uses conditional single-transaction updates (`FOR UPDATE
//! SKIP LOCKED` re-checks, compare-and-set on `status`/`lease_owner`), so
//! multiple orchestrator replicas can run against the same database without
//! any coordination beyond it.
//!
//! Queries are runtime-checked; the schema lives in `migrations/` and is
//! applied with [`PgStore::migrate`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use conductor_core::outbox::envelope;
use conductor_core::{
    dataset_id_of, event, Job, JobEvent, JobId, JobStatus, NewJob, OutboxId, OutboxRow,
    OutboxStatus, RetryPolicy, TransitionUpdate, WorkerInfo,
};

use crate::error::StoreError;
use crate::r#trait::{ExpiryOutcome, LeaseBeat, LeaseExpiry, QueueCounts, Store};

const JOB_COLUMNS: &str = "id, kind, queue, priority, payload, status, attempts, \
     cancel_requested, lease_owner, lease_until, error, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, job_id, event, status, attempts, next_attempt_at, \
     locked_by, locked_until, last_error, delivered_at, created_at";

/// How many pending candidates one claim attempt scans before giving up.
const CLAIM_SCAN_LIMIT: i64 = 16;

/// Postgres store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock and claim one specific candidate, or back off if it was taken
    /// or its dataset is busy.
    async fn try_claim_candidate(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
        lock_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, payload
            FROM jobs
            WHERE id = $1
              AND status = 'pending'
              AND (lease_until IS NULL OR lease_until <= $2)
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(r) => r,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        let payload: JsonValue = row.try_get("payload")?;
        if let Some(dataset_id) = dataset_id_of(&payload) {
            let lock_until = now + to_chrono(lease) + to_chrono(lock_grace);
            let ok =
                try_acquire_dataset_lock_tx(&mut tx, dataset_id, job_id, lock_until, now).await?;
            if !ok {
                tx.rollback().await?;
                return Ok(None);
            }
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                lease_owner = $2,
                lease_until = $3,
                attempts = attempts + 1,
                error = NULL,
                updated_at = $4
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(now + to_chrono(lease))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let job = job_from_row(&row)?;

        append_event_tx(
            &mut tx,
            job.id,
            &serde_json::json!({
                "type": event::types::CLAIMED,
                "worker_id": worker_id,
                "attempts": job.attempts,
                "queue": job.queue,
            }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    /// Reclaim one expired lease, if still expired once row-locked.
    async fn try_reclaim(
        &self,
        job_id: Uuid,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseExpiry>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, attempts, payload
            FROM jobs
            WHERE id = $1 AND status = 'running' AND lease_until < $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(r) => r,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        let attempts: i32 = row.try_get("attempts")?;
        let payload: JsonValue = row.try_get("payload")?;

        let (outcome, ev) = if attempts >= policy.max_attempts {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    error = 'lease_exhausted',
                    lease_owner = NULL,
                    lease_until = NULL,
                    updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            (
                ExpiryOutcome::Exhausted,
                serde_json::json!({
                    "type": event::types::LEASE_EXPIRED,
                    "attempts": attempts,
                    "outcome": "failed",
                    "error": "lease_exhausted",
                }),
            )
        } else {
            let next = now
                + to_chrono(
                    policy.delay_for_attempt(attempts, JobId::from_uuid(job_id).jitter_seed()),
                );
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    lease_owner = NULL,
                    lease_until = $2,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(next)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            (
                ExpiryOutcome::Requeued {
                    next_attempt_at: next,
                },
                serde_json::json!({
                    "type": event::types::LEASE_EXPIRED,
                    "attempts": attempts,
                    "outcome": "requeued",
                    "next_attempt_at": next,
                }),
            )
        };

        if let Some(dataset_id) = dataset_id_of(&payload) {
            sqlx::query(r#"DELETE FROM dataset_locks WHERE dataset_id = $1 AND job_id = $2"#)
                .bind(dataset_id)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        append_event_tx(&mut tx, JobId::from_uuid(job_id), &ev, now).await?;
        tx.commit().await?;

        Ok(Some(LeaseExpiry {
            job_id: JobId::from_uuid(job_id),
            attempts,
            outcome,
        }))
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Job {
        id: JobId::from_uuid(row.try_get("id")?),
        kind: row.try_get("kind")?,
        queue: row.try_get("queue")?,
        priority: row.try_get("priority")?,
        payload: row.try_get("payload")?,
        status,
        attempts: row.try_get("attempts")?,
        cancel_requested: row.try_get("cancel_requested")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_until: row.try_get("lease_until")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxRow, StoreError> {
    let status: String = row.try_get("status")?;
    let status = OutboxStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(OutboxRow {
        id: OutboxId::from_uuid(row.try_get("id")?),
        job_id: JobId::from_uuid(row.try_get("job_id")?),
        event: row.try_get("event")?,
        status,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_until: row.try_get("locked_until")?,
        last_error: row.try_get("last_error")?,
        delivered_at: row.try_get("delivered_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert the job event and its webhook outbox row in the caller's
/// transaction, so a crash after commit never loses the notification.
async fn append_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    ev: &JsonValue,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(r#"INSERT INTO job_events (job_id, ts, event) VALUES ($1, $2, $3)"#)
        .bind(Uuid::from(job_id))
        .bind(now)
        .bind(ev)
        .execute(&mut **tx)
        .await?;

    let outbox_id = OutboxId::new();
    let env = envelope(outbox_id, job_id, ev, now);
    sqlx::query(
        r#"
        INSERT INTO webhook_outbox (id, job_id, event, next_attempt_at, created_at)
        VALUES ($1, $2, $3, $4, $4)
        "#,
    )
    .bind(Uuid::from(outbox_id))
    .bind(Uuid::from(job_id))
    .bind(env)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upsert-with-expiry-check acquisition: succeeds when no row exists, the
/// existing row is expired, or it already belongs to the requesting job.
async fn try_acquire_dataset_lock_tx(
    tx: &mut Transaction<'_, Postgres>,
    dataset_id: &str,
    job_id: Uuid,
    lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO dataset_locks (dataset_id, job_id, lease_until)
        VALUES ($1, $2, $3)
        ON CONFLICT (dataset_id) DO UPDATE
          SET job_id = EXCLUDED.job_id,
              lease_until = EXCLUDED.lease_until
        WHERE dataset_locks.lease_until < $4
           OR dataset_locks.job_id = EXCLUDED.job_id
        RETURNING dataset_id
        "#,
    )
    .bind(dataset_id)
    .bind(job_id)
    .bind(lease_until)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.is_some())
}

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let job = new.into_job(now);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (id, kind, queue, priority, payload, status, attempts,
                              cancel_requested, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, FALSE, $6, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::from(job.id))
        .bind(&job.kind)
        .bind(&job.queue)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let job = job_from_row(&row)?;

        append_event_tx(
            &mut tx,
            job.id,
            &serde_json::json!({
                "type": event::types::SUBMITTED,
                "kind": job.kind,
                "queue": job.queue,
                "priority": job.priority,
            }),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(r#"SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"#))
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;
        job_from_row(&row)
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT $1"#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, job_id, ts, event FROM job_events WHERE job_id = $1 ORDER BY id ASC"#,
        )
        .bind(Uuid::from(job_id))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(JobEvent {
                    id: row.try_get("id")?,
                    job_id: JobId::from_uuid(row.try_get("job_id")?),
                    ts: row.try_get("ts")?,
                    event: row.try_get("event")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(queue = %queue, worker_id = %worker_id))]
    async fn claim_next_job(
        &self,
        queue: &str,
        cap: usize,
        worker_id: &str,
        lease: Duration,
        lock_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let running: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint FROM jobs
            WHERE queue = $1 AND status = 'running' AND lease_until > $2
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        if running >= cap as i64 {
            return Ok(None);
        }

        let candidates: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE queue = $1
              AND status = 'pending'
              AND (lease_until IS NULL OR lease_until <= $2)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(CLAIM_SCAN_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        for candidate in candidates {
            if let Some(job) = self
                .try_claim_candidate(candidate, worker_id, lease, lock_grace, now)
                .await?
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn heartbeat_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseBeat, StoreError> {
        let renewed = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_until = $3, updated_at = $4
            WHERE id = $1 AND lease_owner = $2 AND status IN ('running', 'paused')
            RETURNING status, cancel_requested
            "#,
        )
        .bind(Uuid::from(id))
        .bind(worker_id)
        .bind(now + to_chrono(lease))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = renewed {
            let status: String = row.try_get("status")?;
            return Ok(LeaseBeat {
                renewed: true,
                status: JobStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                cancel_requested: row.try_get("cancel_requested")?,
            });
        }

        let row = sqlx::query(r#"SELECT status, cancel_requested FROM jobs WHERE id = $1"#)
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;
        let status: String = row.try_get("status")?;
        Ok(LeaseBeat {
            renewed: false,
            status: JobStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            cancel_requested: row.try_get("cancel_requested")?,
        })
    }

    async fn append_progress(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
        ev: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<LeaseBeat, StoreError> {
        let mut tx = self.pool.begin().await?;

        let renewed = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_until = $3, updated_at = $4
            WHERE id = $1 AND lease_owner = $2 AND status = 'running'
            RETURNING status, cancel_requested
            "#,
        )
        .bind(Uuid::from(id))
        .bind(worker_id)
        .bind(now + to_chrono(lease))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match renewed {
            Some(row) => {
                let status: String = row.try_get("status")?;
                let beat = LeaseBeat {
                    renewed: true,
                    status: JobStatus::parse(&status)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    cancel_requested: row.try_get("cancel_requested")?,
                };
                append_event_tx(&mut tx, id, &ev, now).await?;
                tx.commit().await?;
                Ok(beat)
            }
            None => {
                tx.rollback().await?;
                let row = sqlx::query(r#"SELECT status, cancel_requested FROM jobs WHERE id = $1"#)
                    .bind(Uuid::from(id))
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;
                let status: String = row.try_get("status")?;
                Ok(LeaseBeat {
                    renewed: false,
                    status: JobStatus::parse(&status)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    cancel_requested: row.try_get("cancel_requested")?,
                })
            }
        }
    }

    async fn transition(
        &self,
        id: JobId,
        expected: &[JobStatus],
        expected_owner: Option<&str>,
        update: TransitionUpdate,
        ev: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let expected_strs: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                status = CASE WHEN $3::bool THEN $4::text ELSE status END,
                error = CASE WHEN $5::bool THEN $6::text ELSE error END,
                lease_owner = CASE WHEN $7::bool THEN NULL ELSE lease_owner END,
                lease_until = CASE WHEN $8::bool THEN $9::timestamptz ELSE lease_until END,
                cancel_requested = CASE WHEN $10::bool THEN $11::bool ELSE cancel_requested END,
                updated_at = $12
            WHERE id = $1
              AND status = ANY($2)
              AND ($13::text IS NULL OR lease_owner = $13)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::from(id))
        .bind(&expected_strs)
        .bind(update.to.is_some())
        .bind(update.to.map(|s| s.as_str().to_string()))
        .bind(update.set_error.is_some())
        .bind(update.set_error.clone().flatten())
        .bind(update.clear_lease_owner)
        .bind(update.set_lease_until.is_some())
        .bind(update.set_lease_until.flatten())
        .bind(update.set_cancel_requested.is_some())
        .bind(update.set_cancel_requested.unwrap_or(false))
        .bind(now)
        .bind(expected_owner)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match row {
            Some(r) => r,
            None => {
                tx.rollback().await?;
                let current: Option<String> =
                    sqlx::query_scalar(r#"SELECT status FROM jobs WHERE id = $1"#)
                        .bind(Uuid::from(id))
                        .fetch_optional(&self.pool)
                        .await?;
                return Err(match current {
                    Some(status) => StoreError::conflict(format!(
                        "job {id} is {status}, expected one of {expected_strs:?}"
                    )),
                    None => StoreError::not_found(format!("job {id}")),
                });
            }
        };
        let job = job_from_row(&row)?;

        if update.release_dataset_lock {
            if let Some(dataset_id) = job.dataset_id() {
                sqlx::query(r#"DELETE FROM dataset_locks WHERE dataset_id = $1 AND job_id = $2"#)
                    .bind(dataset_id)
                    .bind(Uuid::from(id))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        append_event_tx(&mut tx, id, &ev, now).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn register_worker(
        &self,
        id: &str,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, started_at, last_heartbeat)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (id) DO UPDATE
              SET hostname = EXCLUDED.hostname,
                  last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(id)
        .bind(hostname)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_worker(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let res = sqlx::query(r#"UPDATE workers SET last_heartbeat = $2 WHERE id = $1"#)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_active_workers(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<WorkerInfo>, StoreError> {
        let cutoff = now - to_chrono(ttl);
        let rows = sqlx::query(
            r#"
            SELECT id, hostname, started_at, last_heartbeat
            FROM workers
            WHERE last_heartbeat >= $1
            ORDER BY id ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(WorkerInfo {
                    id: row.try_get("id")?,
                    hostname: row.try_get("hostname")?,
                    started_at: row.try_get("started_at")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                })
            })
            .collect()
    }

    async fn acquire_dataset_lock(
        &self,
        dataset_id: &str,
        job_id: JobId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ok =
            try_acquire_dataset_lock_tx(&mut tx, dataset_id, Uuid::from(job_id), lease_until, now)
                .await?;
        tx.commit().await?;
        Ok(ok)
    }

    async fn release_dataset_lock(
        &self,
        dataset_id: &str,
        job_id: JobId,
    ) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM dataset_locks WHERE dataset_id = $1 AND job_id = $2"#)
            .bind(dataset_id)
            .bind(Uuid::from(job_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn expire_dataset_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query(r#"DELETE FROM dataset_locks WHERE lease_until < $1"#)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn locked_dataset_count(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*)::bigint FROM dataset_locks WHERE lease_until > $1"#)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    #[instrument(skip(self, policy))]
    async fn expire_leases(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<LeaseExpiry>, StoreError> {
        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM jobs WHERE status = 'running' AND lease_until < $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for job_id in expired {
            if let Some(expiry) = self.try_reclaim(job_id, policy, now).await? {
                reclaimed.push(expiry);
            }
        }
        Ok(reclaimed)
    }

    async fn outbox_claim_batch(
        &self,
        limit: usize,
        claimant: &str,
        lock: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM webhook_outbox
            WHERE status = 'pending'
              AND delivered_at IS NULL
              AND next_attempt_at <= $1
              AND (locked_until IS NULL OR locked_until <= $1)
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed: Vec<OutboxRow> = rows
            .iter()
            .map(outbox_from_row)
            .collect::<Result<_, _>>()?;
        if claimed.is_empty() {
            tx.rollback().await?;
            return Ok(claimed);
        }

        let ids: Vec<Uuid> = claimed.iter().map(|r| Uuid::from(r.id)).collect();
        let locked_until = now + to_chrono(lock);
        sqlx::query(
            r#"UPDATE webhook_outbox SET locked_by = $1, locked_until = $2 WHERE id = ANY($3)"#,
        )
        .bind(claimant)
        .bind(locked_until)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        for row in claimed.iter_mut() {
            row.locked_by = Some(claimant.to_string());
            row.locked_until = Some(locked_until);
        }
        Ok(claimed)
    }

    async fn outbox_mark_delivered(
        &self,
        id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE webhook_outbox
            SET status = 'delivered', delivered_at = $2,
                locked_by = NULL, locked_until = NULL, last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .bind(now)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("outbox row {id}")));
        }
        Ok(())
    }

    async fn outbox_mark_failed(
        &self,
        id: OutboxId,
        attempts: i32,
        error: &str,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE webhook_outbox
            SET status = 'failed', attempts = $2, last_error = $3,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("outbox row {id}")));
        }
        Ok(())
    }

    async fn outbox_reschedule(
        &self,
        id: OutboxId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE webhook_outbox
            SET status = 'pending', attempts = $2, next_attempt_at = $3, last_error = $4,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("outbox row {id}")));
        }
        Ok(())
    }

    async fn outbox_rescue(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE webhook_outbox
            SET locked_by = NULL, locked_until = NULL
            WHERE delivered_at IS NULL
              AND locked_until IS NOT NULL
              AND locked_until < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn outbox_rows(&self, job_id: JobId) -> Result<Vec<OutboxRow>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {OUTBOX_COLUMNS} FROM webhook_outbox WHERE job_id = $1 ORDER BY created_at ASC, id ASC"#
        ))
        .bind(Uuid::from(job_id))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn queue_counts(&self) -> Result<HashMap<String, QueueCounts>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue, status, COUNT(*)::bigint AS n
            FROM jobs
            WHERE status IN ('running', 'pending')
            GROUP BY queue, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<String, QueueCounts> = HashMap::new();
        for row in rows {
            let queue: String = row.try_get("queue")?;
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let entry = counts.entry(queue).or_default();
            match status.as_str() {
                "running" => entry.running = n,
                _ => entry.pending = n,
            }
        }
        Ok(counts)
    }
}
