//! Process-wide tracing setup for the orchestrator and its background
//! loops.
//!
//! `RUST_LOG` overrides everything; without it the orchestrator logs at
//! `info` while the chattier dependencies (sqlx statement logging, hyper
//! connection churn) are held at `warn` so lease heartbeats and outbox
//! polls do not drown the job lifecycle.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,tower_http=warn";

/// Initialize logging for this orchestrator instance.
///
/// `instance` is the replica's self-asserted id (hostname-derived); it is
/// stamped on the startup line so interleaved logs from replicas sharing a
/// sink can be told apart. Safe to call multiple times, which keeps test
/// binaries that share a process happy.
pub fn init(instance: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(instance, "logging initialized");
    }
}
