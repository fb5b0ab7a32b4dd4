//! Webhook outbox model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::id::{JobId, OutboxId};

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "delivered" => Ok(OutboxStatus::Delivered),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(CoreError::internal(format!("unknown outbox status: {other}"))),
        }
    }
}

/// One durable outbound notification. Inserted in the same transaction as
/// the lifecycle change it announces, so no event is lost on a crash after
/// commit. Invariant: `delivered_at` is set iff `status = delivered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: OutboxId,
    pub job_id: JobId,
    /// Envelope `{id, job_id, type, ts, data}`; `id` equals the row id so
    /// the idempotency key also appears in the body.
    pub event: JsonValue,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRow {
    /// A row may be claimed by a delivery worker iff it is undelivered, due,
    /// and not locked by a live claimant.
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.delivered_at.is_none()
            && self.status == OutboxStatus::Pending
            && self.next_attempt_at <= now
            && self.locked_until.map(|t| t <= now).unwrap_or(true)
    }
}

/// Build the delivery envelope for a job event.
pub fn envelope(
    outbox_id: OutboxId,
    job_id: JobId,
    event: &JsonValue,
    ts: DateTime<Utc>,
) -> JsonValue {
    serde_json::json!({
        "id": outbox_id,
        "job_id": job_id,
        "type": event.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
        "ts": ts,
        "data": event,
    })
}
