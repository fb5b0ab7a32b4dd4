//! Job model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::id::JobId;

/// Job execution status.
///
/// Terminal statuses (`done`, `failed`, `cancelled`) never transition away
/// except `failed`/`cancelled` -> `pending` via an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a claim. `lease_until` on a pending job is the
    /// retry timer: the job is not claimable before it elapses.
    Pending,
    /// Leased to a worker.
    Running,
    /// Suspended by the operator; the lease is retained.
    Paused,
    /// Completed successfully.
    Done,
    /// Terminal failure (permanent error or attempts exhausted).
    Failed,
    /// Cancelled by the operator, acknowledged by the worker or reclaimed.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Column value used by the Postgres store.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(CoreError::internal(format!("unknown job status: {other}"))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An orchestrated job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Free-form kind string; routed by workers, never validated here.
    pub kind: String,
    /// Queue partition; concurrency-capped independently of other queues.
    pub queue: String,
    /// Higher runs earlier. Ties break on `created_at`, then `id`.
    pub priority: i32,
    /// Opaque payload. The orchestrator only ever reads `dataset_id`.
    pub payload: JsonValue,
    pub status: JobStatus,
    pub attempts: i32,
    /// Set by a cancel request while running; workers observe it on the
    /// next progress or lease heartbeat and are expected to stop.
    pub cancel_requested: bool,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The dataset this job needs exclusive access to, if any.
    pub fn dataset_id(&self) -> Option<&str> {
        dataset_id_of(&self.payload)
    }

    /// A running job whose lease has lapsed is reclaimable by the sweeper.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.lease_until.map(|t| t < now).unwrap_or(true)
    }
}

/// Well-known payload field declaring exclusive dataset access.
pub fn dataset_id_of(payload: &JsonValue) -> Option<&str> {
    payload.get("dataset_id").and_then(|v| v.as_str())
}

/// A job submission, validated before insertion.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub kind: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub payload: Option<JsonValue>,
}

impl NewJob {
    pub const DEFAULT_QUEUE: &'static str = "default";

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.kind.trim().is_empty() {
            return Err(CoreError::validation("kind must not be empty"));
        }
        if let Some(q) = &self.queue {
            if q.trim().is_empty() {
                return Err(CoreError::validation("queue must not be empty"));
            }
        }
        if let Some(p) = &self.payload {
            if !(p.is_object() || p.is_null()) {
                return Err(CoreError::validation("payload must be an object"));
            }
        }
        Ok(())
    }

    /// Materialize the pending job row.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            kind: self.kind,
            queue: self
                .queue
                .unwrap_or_else(|| Self::DEFAULT_QUEUE.to_string()),
            priority: self.priority.unwrap_or(0),
            payload: self.payload.unwrap_or(JsonValue::Null),
            status: JobStatus::Pending,
            attempts: 0,
            cancel_requested: false,
            lease_owner: None,
            lease_until: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field updates applied together with a conditional status change.
///
/// All lifecycle mutations go through `Store::transition` carrying one of
/// these; the store applies it only when the current status matches the
/// expectation (and, when given, the lease owner), in the same transaction
/// that appends the job event and its outbox row.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub to: Option<JobStatus>,
    /// `Some(None)` clears the error column.
    pub set_error: Option<Option<String>>,
    /// Clear `lease_owner`; pair with `set_lease_until` for retry timers.
    pub clear_lease_owner: bool,
    /// `Some(None)` clears the lease/retry timer.
    pub set_lease_until: Option<Option<DateTime<Utc>>>,
    pub set_cancel_requested: Option<bool>,
    /// Delete this job's dataset lock row, if it holds one.
    pub release_dataset_lock: bool,
}

impl TransitionUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            to: Some(status),
            ..Default::default()
        }
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.set_error = Some(error);
        self
    }

    pub fn clear_lease(mut self) -> Self {
        self.clear_lease_owner = true;
        self.set_lease_until = Some(None);
        self
    }

    pub fn lease_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.set_lease_until = Some(until);
        self
    }

    pub fn cancel_requested(mut self, flag: bool) -> Self {
        self.set_cancel_requested = Some(flag);
        self
    }

    pub fn release_lock(mut self) -> Self {
        self.release_dataset_lock = true;
        self
    }
}
