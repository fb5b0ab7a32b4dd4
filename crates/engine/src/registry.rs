//! Worker registry: liveness via heartbeats.
//!
//! Liveness is advisory. A worker missing its heartbeats is ignored for
//! attribution, but its leases are reclaimed by the sweeper through
//! `lease_until`, never by the registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use conductor_core::{CoreResult, WorkerInfo};
use conductor_store::Store;

pub struct Registry<S> {
    store: Arc<S>,
    heartbeat_ttl: Duration,
}

impl<S: Store> Registry<S> {
    pub fn new(store: Arc<S>, heartbeat_ttl: Duration) -> Self {
        Self {
            store,
            heartbeat_ttl,
        }
    }

    pub async fn register(&self, worker_id: &str, hostname: &str) -> CoreResult<()> {
        self.store
            .register_worker(worker_id, hostname, Utc::now())
            .await?;
        Ok(())
    }

    /// Heartbeat beacon. Unknown workers are registered on first contact so
    /// a beacon after an orchestrator restart never 404s.
    pub async fn heartbeat(&self, worker_id: &str, hostname: Option<&str>) -> CoreResult<()> {
        let now = Utc::now();
        if !self.store.heartbeat_worker(worker_id, now).await? {
            self.store
                .register_worker(worker_id, hostname.unwrap_or(worker_id), now)
                .await?;
        }
        Ok(())
    }

    pub async fn active(&self) -> CoreResult<Vec<WorkerInfo>> {
        Ok(self
            .store
            .list_active_workers(Utc::now(), self.heartbeat_ttl)
            .await?)
    }
}
