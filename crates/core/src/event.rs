//! Append-only job event log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::JobId;

/// One row in the append-only event log. Events are never mutated or
/// deleted; within a job they are strictly ordered by `(ts, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Monotonic sequence assigned by the store.
    pub id: i64,
    pub job_id: JobId,
    pub ts: DateTime<Utc>,
    pub event: JsonValue,
}

impl JobEvent {
    /// The `type` tag of the event payload, when present.
    pub fn event_type(&self) -> Option<&str> {
        self.event.get("type").and_then(|v| v.as_str())
    }
}

/// Event type tags emitted by the lifecycle controller and sweeper.
pub mod types {
    pub const SUBMITTED: &str = "submitted";
    pub const CLAIMED: &str = "claimed";
    pub const PROGRESS: &str = "progress";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
    pub const CANCEL_REQUESTED: &str = "cancel_requested";
    pub const RETRY_REQUESTED: &str = "retry_requested";
    pub const PAUSED: &str = "paused";
    pub const RESUMED: &str = "resumed";
    pub const LEASE_EXPIRED: &str = "lease_expired";
}
