//! In-memory store for tests and single-node dev runs.
//!
//! Implements the full transactional semantics of the trait under one
//! process-wide lock; "transactions" are just critical sections.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};

use conductor_core::outbox::envelope;
use conductor_core::{
    event, Job, JobEvent, JobId, JobStatus, NewJob, OutboxId, OutboxRow, OutboxStatus, RetryPolicy,
    TransitionUpdate, WorkerInfo,
};

use crate::error::StoreError;
use crate::r#trait::{ExpiryOutcome, LeaseBeat, LeaseExpiry, QueueCounts, Store};

#[derive(Debug, Clone)]
struct DatasetLock {
    job_id: JobId,
    lease_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    events: Vec<JobEvent>,
    next_event_id: i64,
    workers: HashMap<String, WorkerInfo>,
    dataset_locks: HashMap<String, DatasetLock>,
    outbox: Vec<OutboxRow>,
}

/// In-memory store. Cheap to construct per test.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn append_event(inner: &mut Inner, job_id: JobId, event: JsonValue, now: DateTime<Utc>) {
    inner.next_event_id += 1;
    inner.events.push(JobEvent {
        id: inner.next_event_id,
        job_id,
        ts: now,
        event: event.clone(),
    });

    let outbox_id = OutboxId::new();
    inner.outbox.push(OutboxRow {
        id: outbox_id,
        job_id,
        event: envelope(outbox_id, job_id, &event, now),
        status: OutboxStatus::Pending,
        attempts: 0,
        next_attempt_at: now,
        locked_by: None,
        locked_until: None,
        last_error: None,
        delivered_at: None,
        created_at: now,
    });
}

fn release_lock_of(inner: &mut Inner, job: &Job) {
    if let Some(ds) = job.dataset_id() {
        if inner
            .dataset_locks
            .get(ds)
            .map(|l| l.job_id == job.id)
            .unwrap_or(false)
        {
            inner.dataset_locks.remove(ds);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let job = new.into_job(now);
        let mut inner = self.inner.write().unwrap();
        inner.jobs.insert(job.id, job.clone());
        append_event(
            &mut inner,
            job.id,
            json!({
                "type": event::types::SUBMITTED,
                "kind": job.kind,
                "queue": job.queue,
                "priority": job.priority,
            }),
            now,
        );
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn claim_next_job(
        &self,
        queue: &str,
        cap: usize,
        worker_id: &str,
        lease: Duration,
        lock_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.write().unwrap();

        let running = inner
            .jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.status == JobStatus::Running
                    && j.lease_until.map(|t| t > now).unwrap_or(false)
            })
            .count();
        if running >= cap {
            return Ok(None);
        }

        let mut candidates: Vec<(i32, DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.status == JobStatus::Pending
                    && j.lease_until.map(|t| t <= now).unwrap_or(true)
            })
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, _, job_id) in candidates {
            let mut job = inner.jobs.get(&job_id).cloned().unwrap();

            if let Some(ds) = job.dataset_id().map(|s| s.to_string()) {
                match inner.dataset_locks.get(&ds) {
                    Some(l) if l.lease_until > now && l.job_id != job.id => continue,
                    _ => {
                        inner.dataset_locks.insert(
                            ds,
                            DatasetLock {
                                job_id: job.id,
                                lease_until: now + chrono_dur(lease) + chrono_dur(lock_grace),
                            },
                        );
                    }
                }
            }

            job.status = JobStatus::Running;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_until = Some(now + chrono_dur(lease));
            job.attempts += 1;
            job.error = None;
            job.updated_at = now;

            let ev = json!({
                "type": event::types::CLAIMED,
                "worker_id": worker_id,
                "attempts": job.attempts,
                "queue": job.queue,
            });
            inner.jobs.insert(job_id, job.clone());
            append_event(&mut inner, job_id, ev, now);
            return Ok(Some(job));
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
        let mut inner = self.inner.write().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;

        let owned = job.lease_owner.as_deref() == Some(worker_id)
            && matches!(job.status, JobStatus::Running | JobStatus::Paused);
        if owned {
            job.lease_until = Some(now + chrono_dur(lease));
            job.updated_at = now;
        }
        Ok(LeaseBeat {
            renewed: owned,
            status: job.status,
            cancel_requested: job.cancel_requested,
        })
    }

    async fn append_progress(
        &self,
        id: JobId,
        worker_id: &str,
        lease: Duration,
        event: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<LeaseBeat, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;

        let owned =
            job.lease_owner.as_deref() == Some(worker_id) && job.status == JobStatus::Running;
        let beat = LeaseBeat {
            renewed: owned,
            status: job.status,
            cancel_requested: job.cancel_requested,
        };
        if owned {
            job.lease_until = Some(now + chrono_dur(lease));
            job.updated_at = now;
            append_event(&mut inner, id, event, now);
        }
        Ok(beat)
    }

    async fn transition(
        &self,
        id: JobId,
        expected: &[JobStatus],
        expected_owner: Option<&str>,
        update: TransitionUpdate,
        event: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut job = inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;

        if !expected.contains(&job.status) {
            return Err(StoreError::conflict(format!(
                "job {id} is {}, expected one of {:?}",
                job.status, expected
            )));
        }
        if let Some(owner) = expected_owner {
            if job.lease_owner.as_deref() != Some(owner) {
                return Err(StoreError::conflict(format!(
                    "job {id} lease is not held by {owner}"
                )));
            }
        }

        if let Some(to) = update.to {
            job.status = to;
        }
        if let Some(error) = update.set_error {
            job.error = error;
        }
        if update.clear_lease_owner {
            job.lease_owner = None;
        }
        if let Some(until) = update.set_lease_until {
            job.lease_until = until;
        }
        if let Some(flag) = update.set_cancel_requested {
            job.cancel_requested = flag;
        }
        job.updated_at = now;

        if update.release_dataset_lock {
            release_lock_of(&mut inner, &job);
        }
        inner.jobs.insert(id, job.clone());
        append_event(&mut inner, id, event, now);
        Ok(job)
    }

    async fn register_worker(
        &self,
        id: &str,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .workers
            .entry(id.to_string())
            .or_insert_with(|| WorkerInfo {
                id: id.to_string(),
                hostname: hostname.to_string(),
                started_at: now,
                last_heartbeat: now,
            });
        entry.hostname = hostname.to_string();
        entry.last_heartbeat = now;
        Ok(())
    }

    async fn heartbeat_worker(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.workers.get_mut(id) {
            Some(w) => {
                w.last_heartbeat = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_active_workers(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<WorkerInfo>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut active: Vec<WorkerInfo> = inner
            .workers
            .values()
            .filter(|w| w.is_alive(now, ttl))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn acquire_dataset_lock(
        &self,
        dataset_id: &str,
        job_id: JobId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.dataset_locks.get(dataset_id) {
            Some(l) if l.lease_until > now && l.job_id != job_id => Ok(false),
            _ => {
                inner
                    .dataset_locks
                    .insert(dataset_id.to_string(), DatasetLock { job_id, lease_until });
                Ok(true)
            }
        }
    }

    async fn release_dataset_lock(
        &self,
        dataset_id: &str,
        job_id: JobId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner
            .dataset_locks
            .get(dataset_id)
            .map(|l| l.job_id == job_id)
            .unwrap_or(false)
        {
            inner.dataset_locks.remove(dataset_id);
        }
        Ok(())
    }

    async fn expire_dataset_locks(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.dataset_locks.len();
        inner.dataset_locks.retain(|_, l| l.lease_until >= now);
        Ok((before - inner.dataset_locks.len()) as u64)
    }

    async fn locked_dataset_count(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .dataset_locks
            .values()
            .filter(|l| l.lease_until > now)
            .count() as i64)
    }

    async fn expire_leases(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<LeaseExpiry>, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for job_id in expired {
            let mut job = inner.jobs.get(&job_id).cloned().unwrap();
            let attempts = job.attempts;

            let outcome = if attempts >= policy.max_attempts {
                job.status = JobStatus::Failed;
                job.error = Some("lease_exhausted".to_string());
                job.lease_owner = None;
                job.lease_until = None;
                ExpiryOutcome::Exhausted
            } else {
                let next = now + chrono_dur(policy.delay_for_attempt(attempts, job_id.jitter_seed()));
                job.status = JobStatus::Pending;
                job.lease_owner = None;
                job.lease_until = Some(next);
                ExpiryOutcome::Requeued {
                    next_attempt_at: next,
                }
            };
            job.updated_at = now;

            let ev = match &outcome {
                ExpiryOutcome::Requeued { next_attempt_at } => json!({
                    "type": event::types::LEASE_EXPIRED,
                    "attempts": attempts,
                    "outcome": "requeued",
                    "next_attempt_at": next_attempt_at,
                }),
                ExpiryOutcome::Exhausted => json!({
                    "type": event::types::LEASE_EXPIRED,
                    "attempts": attempts,
                    "outcome": "failed",
                    "error": "lease_exhausted",
                }),
            };

            release_lock_of(&mut inner, &job);
            inner.jobs.insert(job_id, job);
            append_event(&mut inner, job_id, ev, now);
            reclaimed.push(LeaseExpiry {
                job_id,
                attempts,
                outcome,
            });
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
        let mut inner = self.inner.write().unwrap();

        let mut due: Vec<usize> = inner
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, r)| r.claimable(now))
            .map(|(i, _)| i)
            .collect();
        due.sort_by(|&a, &b| {
            inner.outbox[a]
                .next_attempt_at
                .cmp(&inner.outbox[b].next_attempt_at)
                .then(inner.outbox[a].id.cmp(&inner.outbox[b].id))
        });
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let row = &mut inner.outbox[i];
            row.locked_by = Some(claimant.to_string());
            row.locked_until = Some(now + chrono_dur(lock));
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn outbox_mark_delivered(
        &self,
        id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found(format!("outbox row {id}")))?;
        row.status = OutboxStatus::Delivered;
        row.delivered_at = Some(now);
        row.locked_by = None;
        row.locked_until = None;
        row.last_error = None;
        Ok(())
    }

    async fn outbox_mark_failed(
        &self,
        id: OutboxId,
        attempts: i32,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found(format!("outbox row {id}")))?;
        row.status = OutboxStatus::Failed;
        row.attempts = attempts;
        row.last_error = Some(error.to_string());
        row.locked_by = None;
        row.locked_until = None;
        Ok(())
    }

    async fn outbox_reschedule(
        &self,
        id: OutboxId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found(format!("outbox row {id}")))?;
        row.status = OutboxStatus::Pending;
        row.attempts = attempts;
        row.next_attempt_at = next_attempt_at;
        row.last_error = Some(error.to_string());
        row.locked_by = None;
        row.locked_until = None;
        Ok(())
    }

    async fn outbox_rescue(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut rescued = 0;
        for row in inner.outbox.iter_mut() {
            if row.delivered_at.is_none()
                && row.locked_until.map(|t| t < now).unwrap_or(false)
            {
                row.locked_by = None;
                row.locked_until = None;
                rescued += 1;
            }
        }
        Ok(rescued)
    }

    async fn outbox_rows(&self, job_id: JobId) -> Result<Vec<OutboxRow>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .outbox
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn queue_counts(&self) -> Result<HashMap<String, QueueCounts>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut counts: HashMap<String, QueueCounts> = HashMap::new();
        for job in inner.jobs.values() {
            let entry = counts.entry(job.queue.clone()).or_default();
            match job.status {
                JobStatus::Running => entry.running += 1,
                JobStatus::Pending => entry.pending += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(120);
    const GRACE: Duration = Duration::from_secs(30);

    fn new_job(kind: &str, queue: &str, priority: i32, payload: JsonValue) -> NewJob {
        NewJob {
            kind: kind.to_string(),
            queue: Some(queue.to_string()),
            priority: Some(priority),
            payload: Some(payload),
        }
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age_then_id() {
        let store = MemoryStore::new();
        let t0 = Utc::now();

        // Insert at distinct creation times so age is observable.
        let low = store
            .insert_job(new_job("a", "q", 0, json!({})), t0)
            .await
            .unwrap();
        let high = store
            .insert_job(new_job("b", "q", 5, json!({})), t0 + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let mid_old = store
            .insert_job(new_job("c", "q", 1, json!({})), t0 + chrono::Duration::seconds(2))
            .await
            .unwrap();
        let mid_new = store
            .insert_job(new_job("d", "q", 1, json!({})), t0 + chrono::Duration::seconds(3))
            .await
            .unwrap();

        let now = t0 + chrono::Duration::seconds(10);
        let order: Vec<JobId> = [
            store.claim_next_job("q", 10, "w1", LEASE, GRACE, now).await.unwrap(),
            store.claim_next_job("q", 10, "w1", LEASE, GRACE, now).await.unwrap(),
            store.claim_next_job("q", 10, "w1", LEASE, GRACE, now).await.unwrap(),
            store.claim_next_job("q", 10, "w1", LEASE, GRACE, now).await.unwrap(),
        ]
        .into_iter()
        .map(|j| j.unwrap().id)
        .collect();

        assert_eq!(order, vec![high.id, mid_old.id, mid_new.id, low.id]);
        assert!(store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_respects_queue_cap() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store
                .insert_job(new_job(&format!("j{i}"), "q", 0, json!({})), now)
                .await
                .unwrap();
        }

        assert!(store.claim_next_job("q", 2, "w1", LEASE, GRACE, now).await.unwrap().is_some());
        assert!(store.claim_next_job("q", 2, "w1", LEASE, GRACE, now).await.unwrap().is_some());
        assert!(store.claim_next_job("q", 2, "w1", LEASE, GRACE, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_cap_queue_never_runs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_job(new_job("j", "q", 0, json!({})), now).await.unwrap();
        assert!(store.claim_next_job("q", 0, "w1", LEASE, GRACE, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dataset_exclusion_serializes_claims() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let j1 = store
            .insert_job(new_job("a", "q", 0, json!({"dataset_id": "D1"})), now)
            .await
            .unwrap();
        let j2 = store
            .insert_job(
                new_job("b", "q", 0, json!({"dataset_id": "D1"})),
                now + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now + chrono::Duration::seconds(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, j1.id);

        // Second job skipped while D1 is held.
        assert!(store
            .claim_next_job("q", 10, "w2", LEASE, GRACE, now + chrono::Duration::seconds(2))
            .await
            .unwrap()
            .is_none());

        // Terminal transition releases the lock; the second claim succeeds.
        store
            .transition(
                j1.id,
                &[JobStatus::Running],
                Some("w1"),
                TransitionUpdate::to(JobStatus::Done).clear_lease().release_lock(),
                json!({"type": "completed"}),
                now + chrono::Duration::seconds(3),
            )
            .await
            .unwrap();

        let next = store
            .claim_next_job("q", 10, "w2", LEASE, GRACE, now + chrono::Duration::seconds(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, j2.id);
    }

    #[tokio::test]
    async fn pending_retry_timer_defers_claims() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();

        // Simulate a backoff timer.
        store
            .transition(
                job.id,
                &[JobStatus::Pending],
                None,
                TransitionUpdate::default()
                    .lease_until(Some(now + chrono::Duration::seconds(30))),
                json!({"type": "failed", "kind": "transient"}),
                now,
            )
            .await
            .unwrap();

        assert!(store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now + chrono::Duration::seconds(10))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now + chrono::Duration::seconds(31))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn transition_reports_conflict_and_not_found() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();

        let err = store
            .transition(
                job.id,
                &[JobStatus::Running],
                None,
                TransitionUpdate::to(JobStatus::Done),
                json!({"type": "completed"}),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .transition(
                JobId::new(),
                &[JobStatus::Pending],
                None,
                TransitionUpdate::to(JobStatus::Cancelled),
                json!({"type": "cancelled"}),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn lease_heartbeat_requires_ownership() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();
        let job = store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now)
            .await
            .unwrap()
            .unwrap();

        let beat = store
            .heartbeat_lease(job.id, "w2", LEASE, now + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(!beat.renewed);

        let beat = store
            .heartbeat_lease(job.id, "w1", LEASE, now + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(beat.renewed);
        let refreshed = store.get_job(job.id).await.unwrap();
        assert_eq!(
            refreshed.lease_until.unwrap(),
            now + chrono::Duration::seconds(5) + chrono::Duration::from_std(LEASE).unwrap()
        );
    }

    #[tokio::test]
    async fn progress_appends_only_for_the_owner() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();
        let job = store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now)
            .await
            .unwrap()
            .unwrap();

        let beat = store
            .append_progress(job.id, "w2", LEASE, json!({"type": "progress"}), now)
            .await
            .unwrap();
        assert!(!beat.renewed);

        store
            .append_progress(job.id, "w1", LEASE, json!({"type": "progress", "step": 1}), now)
            .await
            .unwrap();
        let events = store.job_events(job.id).await.unwrap();
        let types: Vec<&str> = events.iter().filter_map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["submitted", "claimed", "progress"]);
    }

    #[tokio::test]
    async fn expired_leases_requeue_with_backoff() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_job(new_job("a", "q", 0, json!({"dataset_id": "D1"})), now)
            .await
            .unwrap();
        let job = store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now)
            .await
            .unwrap()
            .unwrap();

        let policy = RetryPolicy::job_default();
        let later = now + chrono::Duration::seconds(300);
        let reclaimed = store.expire_leases(later, &policy).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].job_id, job.id);
        assert!(matches!(reclaimed[0].outcome, ExpiryOutcome::Requeued { .. }));

        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.lease_owner.is_none());
        assert_eq!(job.attempts, 1);
        // Backoff timer set; dataset lock released.
        assert!(job.lease_until.unwrap() > later);
        assert_eq!(store.locked_dataset_count(later).await.unwrap(), 0);

        let types: Vec<String> = store
            .job_events(job.id)
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.event_type().map(String::from))
            .collect();
        assert_eq!(types, vec!["submitted", "claimed", "lease_expired"]);
    }

    #[tokio::test]
    async fn exhausted_leases_fail_the_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::job_default()
        };
        let job = store
            .claim_next_job("q", 10, "w1", LEASE, GRACE, now)
            .await
            .unwrap()
            .unwrap();

        let later = now + chrono::Duration::seconds(300);
        let reclaimed = store.expire_leases(later, &policy).await.unwrap();
        assert_eq!(reclaimed[0].outcome, ExpiryOutcome::Exhausted);

        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("lease_exhausted"));
        assert!(job.lease_owner.is_none());
        assert!(job.lease_until.is_none());
    }

    #[tokio::test]
    async fn outbox_claim_locks_rows_exclusively() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();

        let batch = store
            .outbox_claim_batch(32, "d1", Duration::from_secs(60), now)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job_id, job.id);
        assert_eq!(batch[0].locked_by.as_deref(), Some("d1"));

        // Locked row is not claimable by another worker.
        let empty = store
            .outbox_claim_batch(32, "d2", Duration::from_secs(60), now)
            .await
            .unwrap();
        assert!(empty.is_empty());

        // Lock expiry makes it claimable again; rescue clears it eagerly.
        let later = now + chrono::Duration::seconds(120);
        assert_eq!(store.outbox_rescue(later).await.unwrap(), 1);
        let batch = store
            .outbox_claim_batch(32, "d2", Duration::from_secs(60), later)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn delivered_rows_are_consistent_and_final() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = store.insert_job(new_job("a", "q", 0, json!({})), now).await.unwrap();

        let batch = store
            .outbox_claim_batch(1, "d1", Duration::from_secs(60), now)
            .await
            .unwrap();
        store.outbox_mark_delivered(batch[0].id, now).await.unwrap();

        let rows = store.outbox_rows(job.id).await.unwrap();
        assert_eq!(rows[0].status, OutboxStatus::Delivered);
        assert!(rows[0].delivered_at.is_some());
        assert!(rows[0].locked_by.is_none());

        // Delivered rows never come back.
        let later = now + chrono::Duration::seconds(600);
        assert!(store
            .outbox_claim_batch(32, "d1", Duration::from_secs(60), later)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn worker_registry_tracks_liveness() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        store.register_worker("w1", "host-a", now).await.unwrap();
        store.register_worker("w2", "host-b", now).await.unwrap();
        assert_eq!(store.list_active_workers(now, ttl).await.unwrap().len(), 2);

        let later = now + chrono::Duration::seconds(25);
        assert!(store.heartbeat_worker("w1", later).await.unwrap());
        assert!(!store.heartbeat_worker("ghost", later).await.unwrap());

        let latest = now + chrono::Duration::seconds(40);
        let active = store.list_active_workers(latest, ttl).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "w1");
    }
}
