//! Recovery sweeper: reclaims expired job leases, expired dataset locks
//! and outbox rows abandoned by crashed delivery workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use conductor_core::{CoreResult, RetryPolicy};
use conductor_store::{ExpiryOutcome, LeaseExpiry, Store};

/// What one sweep pass reclaimed.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub leases: Vec<LeaseExpiry>,
    pub dataset_locks: u64,
    pub outbox_rescued: u64,
}

pub struct Sweeper<S> {
    store: Arc<S>,
    tick: Duration,
    retry: RetryPolicy,
}

impl<S: Store> Sweeper<S> {
    pub fn new(store: Arc<S>, tick: Duration, retry: RetryPolicy) -> Self {
        Self { store, tick, retry }
    }

    /// One pass, in order: job leases, dataset locks, outbox locks.
    pub async fn sweep(&self) -> CoreResult<SweepReport> {
        let now = Utc::now();

        let leases = self.store.expire_leases(now, &self.retry).await?;
        for expiry in &leases {
            match &expiry.outcome {
                ExpiryOutcome::Requeued { next_attempt_at } => {
                    info!(
                        job_id = %expiry.job_id,
                        attempts = expiry.attempts,
                        next_attempt_at = %next_attempt_at,
                        "lease expired; job requeued"
                    );
                }
                ExpiryOutcome::Exhausted => {
                    warn!(
                        job_id = %expiry.job_id,
                        attempts = expiry.attempts,
                        "lease expired with attempts exhausted; job failed"
                    );
                }
            }
        }

        let dataset_locks = self.store.expire_dataset_locks(now).await?;
        let outbox_rescued = self.store.outbox_rescue(now).await?;
        if outbox_rescued > 0 {
            info!(rescued = outbox_rescued, "cleared abandoned outbox locks");
        }

        Ok(SweepReport {
            leases,
            dataset_locks,
            outbox_rescued,
        })
    }

    /// Cooperative sweep loop; logs and continues on failure.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "sweep failed");
            }
            tokio::time::sleep(self.tick).await;
        }
    }
}
