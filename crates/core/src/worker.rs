//! Worker registry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A worker process known to the registry. Identity is self-asserted (the
/// worker picks its own id, typically hostname-derived); liveness is
/// advisory and only affects attribution, never leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInfo {
    /// Alive iff the last heartbeat is within the TTL.
    pub fn is_alive(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        now - self.last_heartbeat <= ttl
    }
}
