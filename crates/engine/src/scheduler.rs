//! Scheduler: queue-partitioned, priority-aware job selection.
//!
//! Selection itself lives in the store's claim operation so that every
//! orchestrator replica (and every pulling worker) races through the same
//! conditional transaction. This module adds the queue-cap policy, the
//! single-shot pull API, the cooperative tick for embedded dispatch, and
//! the snapshot used by the API.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use conductor_core::{CoreResult, Job};
use conductor_store::Store;

/// Static per-queue concurrency caps, fixed at startup.
#[derive(Debug, Clone)]
pub struct QueueCaps {
    caps: HashMap<String, usize>,
    default_cap: usize,
}

impl QueueCaps {
    pub fn new(caps: HashMap<String, usize>, default_cap: usize) -> Self {
        Self { caps, default_cap }
    }

    /// Unknown queues fall back to the default cap.
    pub fn cap_for(&self, queue: &str) -> usize {
        self.caps.get(queue).copied().unwrap_or(self.default_cap)
    }

    pub fn known_queues(&self) -> impl Iterator<Item = &str> {
        self.caps.keys().map(|s| s.as_str())
    }
}

impl Default for QueueCaps {
    fn default() -> Self {
        let caps = HashMap::from([
            ("default".to_string(), 2),
            ("gpu_queue".to_string(), 2),
            ("training_queue".to_string(), 1),
            ("agent_queue".to_string(), 2),
        ]);
        Self {
            caps,
            default_cap: 2,
        }
    }
}

/// Opaque executor for embedded dispatch: the tick hands claimed jobs here.
/// Worker internals are out of scope; implementations run the job and call
/// back through the lifecycle endpoints like any external worker.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, job: Job);
}

/// Per-queue slice of the scheduler snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub running: i64,
    pub pending: i64,
    pub cap: usize,
}

/// Point-in-time view of the scheduler, served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub running: i64,
    pub pending: i64,
    pub locked_datasets: i64,
    pub workers_active: i64,
    pub capacity_pct: i64,
    pub queues: HashMap<String, QueueSnapshot>,
}

pub struct Scheduler<S> {
    store: Arc<S>,
    caps: QueueCaps,
    lease: Duration,
    lock_grace: Duration,
    heartbeat_ttl: Duration,
    tick: Duration,
    /// Worker id used for claims made by the embedded tick.
    worker_id: String,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl<S: Store> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        caps: QueueCaps,
        lease: Duration,
        lock_grace: Duration,
        heartbeat_ttl: Duration,
        tick: Duration,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            caps,
            lease,
            lock_grace,
            heartbeat_ttl,
            tick,
            worker_id: worker_id.into(),
            dispatcher: None,
        }
    }

    /// Attach an embedded executor; the tick only claims when one is set,
    /// so nothing is ever marked running without an executor behind it.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn caps(&self) -> &QueueCaps {
        &self.caps
    }

    /// Single-shot pull API: the only way workers obtain work. Selection
    /// and locking happen in one store transaction.
    pub async fn claim_next_job(&self, queue: &str, worker_id: &str) -> CoreResult<Option<Job>> {
        let job = self
            .store
            .claim_next_job(
                queue,
                self.caps.cap_for(queue),
                worker_id,
                self.lease,
                self.lock_grace,
                Utc::now(),
            )
            .await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, queue = %queue, worker_id = %worker_id, "job claimed");
        }
        Ok(job)
    }

    /// One scheduler pass: for each queue with pending work, claim eligible
    /// candidates up to the cap and hand them to the dispatcher.
    pub async fn run_tick(&self) -> CoreResult<usize> {
        let dispatcher = match &self.dispatcher {
            Some(d) => d.clone(),
            None => return Ok(0),
        };

        let counts = self.store.queue_counts().await?;
        let queues: BTreeSet<String> = counts
            .iter()
            .filter(|(_, c)| c.pending > 0)
            .map(|(q, _)| q.clone())
            .chain(self.caps.known_queues().map(String::from))
            .collect();

        let mut dispatched = 0;
        for queue in queues {
            loop {
                match self.claim_next_job(&queue, &self.worker_id).await? {
                    Some(job) => {
                        dispatcher.dispatch(job);
                        dispatched += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(dispatched)
    }

    /// Cooperative scheduler loop. Errors are logged and the loop
    /// continues; it never aborts on a single-pass failure.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.run_tick().await {
                warn!(error = %e, "scheduler tick failed");
            }
            tokio::time::sleep(self.tick).await;
        }
    }

    /// Assemble the snapshot served by `GET /training/scheduler`.
    pub async fn snapshot(&self) -> CoreResult<SchedulerSnapshot> {
        let now = Utc::now();
        let counts = self.store.queue_counts().await?;
        let locked_datasets = self.store.locked_dataset_count(now).await?;
        let workers_active = self
            .store
            .list_active_workers(now, self.heartbeat_ttl)
            .await?
            .len() as i64;

        let queue_names: BTreeSet<String> = counts
            .keys()
            .cloned()
            .chain(self.caps.known_queues().map(String::from))
            .collect();

        let mut queues = HashMap::new();
        let mut running = 0;
        let mut pending = 0;
        let mut total_cap = 0usize;
        for name in queue_names {
            let c = counts.get(&name).copied().unwrap_or_default();
            let cap = self.caps.cap_for(&name);
            running += c.running;
            pending += c.pending;
            total_cap += cap;
            queues.insert(
                name,
                QueueSnapshot {
                    running: c.running,
                    pending: c.pending,
                    cap,
                },
            );
        }

        let capacity_pct = if total_cap == 0 {
            0
        } else {
            (running * 100 / total_cap as i64).min(100)
        };

        Ok(SchedulerSnapshot {
            running,
            pending,
            locked_datasets,
            workers_active,
            capacity_pct,
            queues,
        })
    }
}
