//! Lifecycle controller: every job state transition goes through here.
//!
//! All mutations are conditional store updates; on a lost compare-and-set
//! the conflict is reported back to the caller without retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use conductor_core::{
    event, CoreError, CoreResult, Job, JobId, JobStatus, NewJob, RetryPolicy, TransitionUpdate,
};
use conductor_store::{LeaseBeat, Store};

/// Failure class reported by a worker alongside `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    /// Retried automatically with backoff, up to the attempt budget.
    #[default]
    Transient,
    /// Terminal; no auto-retry.
    Permanent,
    /// The worker acknowledged a cancel request; the job ends `cancelled`,
    /// not `failed`.
    Cancelled,
}

/// Outcome of a cancel call: the job afterwards, and whether anything
/// changed (cancel of a terminal job is a no-op).
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub job: Job,
    pub changed: bool,
}

pub struct Lifecycle<S> {
    store: Arc<S>,
    lease: Duration,
    retry: RetryPolicy,
}

impl<S: Store> Lifecycle<S> {
    pub fn new(store: Arc<S>, lease: Duration, retry: RetryPolicy) -> Self {
        Self { store, lease, retry }
    }

    /// Insert a pending job. Never deduplicates: submitting the same body
    /// twice yields two jobs.
    pub async fn submit(&self, new: NewJob) -> CoreResult<Job> {
        new.validate()?;
        let job = self.store.insert_job(new, Utc::now()).await?;
        info!(job_id = %job.id, kind = %job.kind, queue = %job.queue, "job submitted");
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> CoreResult<Job> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list(&self, limit: usize) -> CoreResult<Vec<Job>> {
        Ok(self.store.list_jobs(limit).await?)
    }

    pub async fn events(&self, id: JobId) -> CoreResult<Vec<conductor_core::JobEvent>> {
        // Missing jobs report 404 rather than an empty log.
        self.store.get_job(id).await?;
        Ok(self.store.job_events(id).await?)
    }

    /// Worker-reported progress. Renews the lease and surfaces the cancel
    /// flag so the worker can stop voluntarily.
    pub async fn progress(
        &self,
        id: JobId,
        worker_id: &str,
        data: JsonValue,
    ) -> CoreResult<LeaseBeat> {
        let ev = json!({
            "type": event::types::PROGRESS,
            "worker_id": worker_id,
            "data": data,
        });
        let beat = self
            .store
            .append_progress(id, worker_id, self.lease, ev, Utc::now())
            .await?;
        if !beat.renewed {
            return Err(CoreError::conflict(format!(
                "job {id} is {} and not leased to {worker_id}",
                beat.status
            )));
        }
        Ok(beat)
    }

    /// Lease heartbeat. Unlike `progress` this is not an error when the
    /// lease is lost; the worker reads `renewed` and reacts.
    pub async fn heartbeat(&self, id: JobId, worker_id: &str) -> CoreResult<LeaseBeat> {
        Ok(self
            .store
            .heartbeat_lease(id, worker_id, self.lease, Utc::now())
            .await?)
    }

    pub async fn complete(&self, id: JobId, worker_id: &str) -> CoreResult<Job> {
        let job = self
            .store
            .transition(
                id,
                &[JobStatus::Running],
                Some(worker_id),
                TransitionUpdate::to(JobStatus::Done)
                    .clear_lease()
                    .error(None)
                    .release_lock(),
                json!({"type": event::types::COMPLETED, "worker_id": worker_id}),
                Utc::now(),
            )
            .await?;
        info!(job_id = %id, "job completed");
        Ok(job)
    }

    /// Worker-reported failure. `transient` failures re-enter `pending`
    /// behind a backoff timer until the attempt budget runs out.
    pub async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        kind: FailKind,
    ) -> CoreResult<Job> {
        let now = Utc::now();
        match kind {
            FailKind::Cancelled => {
                let job = self
                    .store
                    .transition(
                        id,
                        &[JobStatus::Running],
                        Some(worker_id),
                        TransitionUpdate::to(JobStatus::Cancelled)
                            .clear_lease()
                            .error(None)
                            .release_lock(),
                        json!({
                            "type": event::types::CANCELLED,
                            "worker_id": worker_id,
                            "reason": error,
                        }),
                        now,
                    )
                    .await?;
                info!(job_id = %id, "job cancelled by worker ack");
                Ok(job)
            }
            FailKind::Permanent => {
                let job = self
                    .store
                    .transition(
                        id,
                        &[JobStatus::Running],
                        Some(worker_id),
                        TransitionUpdate::to(JobStatus::Failed)
                            .clear_lease()
                            .error(Some(error.to_string()))
                            .release_lock(),
                        json!({
                            "type": event::types::FAILED,
                            "kind": "permanent",
                            "worker_id": worker_id,
                            "error": error,
                        }),
                        now,
                    )
                    .await?;
                info!(job_id = %id, error = %error, "job failed permanently");
                Ok(job)
            }
            FailKind::Transient => {
                // Attempts only move on claim, and the job is leased to the
                // caller, so this read is stable for the decision below.
                let current = self.store.get_job(id).await?;
                let will_retry = self.retry.should_retry(current.attempts);

                let job = if will_retry {
                    let next = now
                        + chrono::Duration::from_std(
                            self.retry
                                .delay_for_attempt(current.attempts, id.jitter_seed()),
                        )
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    self.store
                        .transition(
                            id,
                            &[JobStatus::Running],
                            Some(worker_id),
                            TransitionUpdate::to(JobStatus::Pending)
                                .clear_lease()
                                .lease_until(Some(next))
                                .error(Some(error.to_string()))
                                .release_lock(),
                            json!({
                                "type": event::types::FAILED,
                                "kind": "transient",
                                "worker_id": worker_id,
                                "error": error,
                                "attempts": current.attempts,
                                "will_retry": true,
                                "next_attempt_at": next,
                            }),
                            now,
                        )
                        .await?
                } else {
                    self.store
                        .transition(
                            id,
                            &[JobStatus::Running],
                            Some(worker_id),
                            TransitionUpdate::to(JobStatus::Failed)
                                .clear_lease()
                                .error(Some(error.to_string()))
                                .release_lock(),
                            json!({
                                "type": event::types::FAILED,
                                "kind": "transient",
                                "worker_id": worker_id,
                                "error": error,
                                "attempts": current.attempts,
                                "will_retry": false,
                            }),
                            now,
                        )
                        .await?
                };
                info!(job_id = %id, error = %error, will_retry, "job failed transiently");
                Ok(job)
            }
        }
    }

    /// Cancel: immediate from `pending`; cooperative while `running` (flag
    /// plus worker ack or lease expiry); no-op on terminal jobs.
    pub async fn cancel(&self, id: JobId) -> CoreResult<CancelOutcome> {
        let now = Utc::now();
        let job = self.store.get_job(id).await?;

        match job.status {
            JobStatus::Pending => {
                let job = self
                    .store
                    .transition(
                        id,
                        &[JobStatus::Pending],
                        None,
                        TransitionUpdate::to(JobStatus::Cancelled)
                            .clear_lease()
                            .release_lock(),
                        json!({"type": event::types::CANCELLED, "reason": "cancelled before start"}),
                        now,
                    )
                    .await?;
                Ok(CancelOutcome { job, changed: true })
            }
            JobStatus::Running => {
                let job = self
                    .store
                    .transition(
                        id,
                        &[JobStatus::Running],
                        None,
                        TransitionUpdate::default().cancel_requested(true),
                        json!({"type": event::types::CANCEL_REQUESTED}),
                        now,
                    )
                    .await?;
                Ok(CancelOutcome { job, changed: true })
            }
            JobStatus::Paused => Err(CoreError::conflict(format!(
                "job {id} is paused; resume it before cancelling"
            ))),
            _ => Ok(CancelOutcome { job, changed: false }),
        }
    }

    /// Re-queue a failed or cancelled job. Attempts carry forward; the
    /// lease, error and cancel flag are cleared.
    pub async fn retry(&self, id: JobId) -> CoreResult<Job> {
        let job = self
            .store
            .transition(
                id,
                &[JobStatus::Failed, JobStatus::Cancelled],
                None,
                TransitionUpdate::to(JobStatus::Pending)
                    .clear_lease()
                    .error(None)
                    .cancel_requested(false),
                json!({"type": event::types::RETRY_REQUESTED}),
                Utc::now(),
            )
            .await?;
        info!(job_id = %id, attempts = job.attempts, "job requeued by retry");
        Ok(job)
    }

    /// Suspend a running job. The lease is retained so the attached worker
    /// stays accountable; heartbeats keep being accepted while paused.
    pub async fn pause(&self, id: JobId) -> CoreResult<Job> {
        Ok(self
            .store
            .transition(
                id,
                &[JobStatus::Running],
                None,
                TransitionUpdate::to(JobStatus::Paused),
                json!({"type": event::types::PAUSED}),
                Utc::now(),
            )
            .await?)
    }

    /// Resume a paused job with a fresh lease. If the owner died while
    /// paused, the fresh lease expires and the sweeper reclaims the job.
    pub async fn resume(&self, id: JobId) -> CoreResult<Job> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        Ok(self
            .store
            .transition(
                id,
                &[JobStatus::Paused],
                None,
                TransitionUpdate::to(JobStatus::Running).lease_until(Some(lease_until)),
                json!({"type": event::types::RESUMED}),
                now,
            )
            .await?)
    }
}
