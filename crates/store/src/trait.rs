//! The `Store` trait: every atomic operation the orchestrator performs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use conductor_core::{
    Job, JobEvent, JobId, JobStatus, NewJob, OutboxId, OutboxRow, RetryPolicy, TransitionUpdate,
    WorkerInfo,
};

use crate::error::StoreError;

/// Result of a lease heartbeat or progress append.
///
/// `renewed = false` means the caller no longer owns the lease (or the job
/// left the leased statuses); the current state is reported back so workers
/// can react without a second read.
#[derive(Debug, Clone, Copy)]
pub struct LeaseBeat {
    pub renewed: bool,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

/// One job reclaimed by a lease-expiry sweep.
#[derive(Debug, Clone)]
pub struct LeaseExpiry {
    pub job_id: JobId,
    pub attempts: i32,
    pub outcome: ExpiryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Back to `pending`, claimable after the backoff timer.
    Requeued { next_attempt_at: DateTime<Utc> },
    /// Attempts exhausted; job failed with `lease_exhausted`.
    Exhausted,
}

/// Per-queue job counts for the scheduler snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub running: i64,
    pub pending: i64,
}

/// Transactional persistence operations.
///
/// Conditional updates fail with [`StoreError::Conflict`] when they match
/// zero rows and the target exists, [`StoreError::NotFound`] when it does
/// not. Operations that append a job event insert the matching webhook
/// outbox row in the same transaction.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a pending job together with its `submitted` event.
    async fn insert_job(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Most recently created first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Event log for one job, ordered by event id.
    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError>;

    /// Select-and-lock in one step: the highest-priority claimable pending
    /// job in `queue` (priority DESC, created_at ASC, id ASC) whose dataset
    /// lock, if declared, can be acquired. Respects `cap` against running
    /// jobs with live leases. Bumps `attempts`, sets the lease and appends
    /// the `claimed` event.
    async fn claim_next_job(
        &self,
        queue: &str,
        cap: usize,
        worker_id: &str,
        lease: Duration,
        lock_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Renew a job lease. Accepted while `running` or `paused`; refused
    /// (renewed = false) when the caller is not the lease owner.
    async fn heartbeat_lease(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseBeat, StoreError>;

    /// Append a worker progress event and renew the lease, only while
    /// `running` and owned by `worker_id`.
    async fn append_progress(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
        event: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<LeaseBeat, StoreError>;

    /// Conditional state change: applied only when the current status is in
    /// `expected` (and the lease owner matches `expected_owner`, when
    /// given). Appends `event` and its outbox row atomically.
    async fn transition(
        &self,
        id: JobId,
        expected: &[JobStatus],
        expected_owner: Option<&str>,
        update: TransitionUpdate,
        event: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Upsert a worker row with fresh timestamps.
    async fn register_worker(
        &self,
        id: &str,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns false when the worker was never registered.
    async fn heartbeat_worker(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn list_active_workers(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<WorkerInfo>, StoreError>;

    /// Non-blocking try-lock: granted iff no live row exists for the
    /// dataset or the existing row already belongs to `job_id`.
    async fn acquire_dataset_lock(
        &self,
        dataset_id: &str,
        job_id: JobId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release only when held by `job_id`; releasing a lock held by another
    /// job is a no-op.
    async fn release_dataset_lock(&self, dataset_id: &str, job_id: JobId)
        -> Result<(), StoreError>;

    async fn expire_dataset_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn locked_dataset_count(&self, now: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Reclaim running jobs whose lease lapsed: requeue with a backoff
    /// timer, or fail with `lease_exhausted` once `policy.max_attempts` is
    /// reached. Releases dataset locks held by reclaimed jobs and appends a
    /// `lease_expired` event per job.
    async fn expire_leases(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<LeaseExpiry>, StoreError>;

    /// Claim up to `limit` due, unlocked, undelivered outbox rows for
    /// `claimant`, ordered by `next_attempt_at`.
    async fn outbox_claim_batch(
        &self,
        limit: usize,
        claimant: &str,
        lock: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRow>, StoreError>;

    async fn outbox_mark_delivered(
        &self,
        id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn outbox_mark_failed(
        &self,
        id: OutboxId,
        attempts: i32,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn outbox_reschedule(
        &self,
        id: OutboxId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Clear locks abandoned by crashed delivery workers.
    async fn outbox_rescue(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn outbox_rows(&self, job_id: JobId) -> Result<Vec<OutboxRow>, StoreError>;

    /// Running/pending counts per queue.
    async fn queue_counts(&self) -> Result<HashMap<String, QueueCounts>, StoreError>;
}
