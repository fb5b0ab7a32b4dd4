//! Service construction, background loop spawning and the router.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use conductor_engine::{Lifecycle, QueueCaps, Registry, Scheduler, Sweeper};
use conductor_store::{MemoryStore, PgStore, Store};
use conductor_webhook::{DeliveryConfig, DeliveryPool};

use crate::config::OrchestratorConfig;
use crate::{routes_jobs, routes_workers};

/// Everything the handlers need, parameterized over the store backend.
pub struct Services<S> {
    pub store: Arc<S>,
    pub lifecycle: Lifecycle<S>,
    pub scheduler: Arc<Scheduler<S>>,
    pub registry: Registry<S>,
    pub config: OrchestratorConfig,
}

impl<S: Store> Services<S> {
    pub fn build(store: Arc<S>, config: OrchestratorConfig) -> Arc<Self> {
        let caps = QueueCaps::new(config.queue_caps.clone(), config.default_queue_cap);
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            caps,
            config.lease,
            config.lock_grace,
            config.heartbeat_ttl,
            config.scheduler_tick,
            instance_id(),
        ));
        let lifecycle = Lifecycle::new(store.clone(), config.lease, config.job_retry());
        let registry = Registry::new(store.clone(), config.heartbeat_ttl);
        Arc::new(Self {
            store,
            lifecycle,
            scheduler,
            registry,
            config,
        })
    }

    /// Spawn the cooperative loops: scheduler tick, recovery sweeper and
    /// outbox delivery workers. Each loop logs and continues on failure.
    pub fn spawn_loops(self: &Arc<Self>) {
        tokio::spawn(self.scheduler.clone().run());

        let sweeper = Arc::new(Sweeper::new(
            self.store.clone(),
            self.config.sweeper_tick,
            self.config.job_retry(),
        ));
        tokio::spawn(sweeper.run());

        let delivery = Arc::new(DeliveryPool::new(
            self.store.clone(),
            DeliveryConfig {
                urls: self.config.webhook_urls.clone(),
                secret: self.config.webhook_secret.clone(),
                timeout: self.config.webhook_timeout,
                batch: self.config.outbox_batch,
                lock: self.config.outbox_lock,
                workers: self.config.outbox_workers,
                retry: self.config.outbox_retry(),
                poll: self.config.outbox_poll,
            },
        ));
        delivery.spawn(&instance_id());
    }
}

/// Build the application: pick the store from config, run migrations,
/// spawn the background loops, return the router.
pub async fn start(config: OrchestratorConfig) -> anyhow::Result<Router> {
    match config.database_url.clone() {
        Some(url) => {
            let store = PgStore::connect(&url).await?;
            store.migrate().await?;
            info!("using postgres store");
            let services = Services::build(Arc::new(store), config);
            services.spawn_loops();
            Ok(build_router(services))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            let services = Services::build(Arc::new(MemoryStore::new()), config);
            services.spawn_loops();
            Ok(build_router(services))
        }
    }
}

pub fn build_router<S: Store>(services: Arc<Services<S>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/training/jobs",
            post(routes_jobs::create_job::<S>).get(routes_jobs::list_jobs::<S>),
        )
        .route("/training/jobs/:id", get(routes_jobs::get_job::<S>))
        .route("/training/jobs/:id/cancel", post(routes_jobs::cancel_job::<S>))
        .route("/training/jobs/:id/retry", post(routes_jobs::retry_job::<S>))
        .route("/training/jobs/:id/pause", post(routes_jobs::pause_job::<S>))
        .route("/training/jobs/:id/resume", post(routes_jobs::resume_job::<S>))
        .route("/training/scheduler", get(routes_jobs::scheduler_snapshot::<S>))
        .route("/training/jobs/:id/lease", post(routes_workers::lease::<S>))
        .route("/training/jobs/:id/progress", post(routes_workers::progress::<S>))
        .route("/training/jobs/:id/complete", post(routes_workers::complete::<S>))
        .route("/training/jobs/:id/fail", post(routes_workers::fail::<S>))
        .route("/workers/:id/heartbeat", post(routes_workers::heartbeat::<S>))
        .route("/workers/:id/claim", post(routes_workers::claim::<S>))
        .layer(CorsLayer::permissive())
        .with_state(services)
}

async fn health() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}

/// This replica's self-asserted id, used for embedded-tick claims, outbox
/// claimants and log attribution.
pub fn instance_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "orchestrator".to_string())
}
