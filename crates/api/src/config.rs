//! Environment-driven configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use conductor_core::RetryPolicy;

const QUEUE_CAP_PREFIX: &str = "QUEUE_CAP_";

/// Orchestrator configuration, read once at startup. Fail fast, fail loud.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Unset selects the in-memory store (dev/tests).
    pub database_url: Option<String>,
    pub bind_addr: String,

    /// Outbox subscriber endpoints; empty disables delivery.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: String,
    pub webhook_timeout: Duration,

    pub lease: Duration,
    pub lock_grace: Duration,
    pub heartbeat_ttl: Duration,
    pub scheduler_tick: Duration,
    pub sweeper_tick: Duration,

    pub outbox_workers: usize,
    pub outbox_batch: usize,
    pub outbox_lock: Duration,

    pub max_attempts: i32,
    pub max_outbox_attempts: i32,

    /// Job re-claim backoff bounds.
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Webhook redelivery backoff bounds.
    pub outbox_retry_base: Duration,
    pub outbox_retry_cap: Duration,
    /// Idle sleep between empty outbox claim rounds.
    pub outbox_poll: Duration,

    pub queue_caps: HashMap<String, usize>,
    pub default_queue_cap: usize,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let webhook_urls: Vec<String> = std::env::var("WEBHOOK_URLS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        for url in &webhook_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("WEBHOOK_URLS entries must start with http:// or https://: {url}");
            }
        }

        let mut queue_caps = HashMap::from([
            ("default".to_string(), 2),
            ("gpu_queue".to_string(), 2),
            ("training_queue".to_string(), 1),
            ("agent_queue".to_string(), 2),
        ]);
        for (key, value) in std::env::vars() {
            if key == "QUEUE_CAP_DEFAULT" {
                continue;
            }
            if let Some(queue) = key.strip_prefix(QUEUE_CAP_PREFIX) {
                let cap: usize = value
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer"))?;
                queue_caps.insert(queue.to_string(), cap);
            }
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_addr: std::env::var("ORCH_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            webhook_urls,
            webhook_secret: std::env::var("WEBHOOK_SECRET").unwrap_or_default(),
            webhook_timeout: secs("WEBHOOK_TIMEOUT_SECS", 10)?,
            lease: secs("LEASE_SECS", 120)?,
            lock_grace: secs("DATASET_LOCK_GRACE_SECS", 30)?,
            heartbeat_ttl: secs("HEARTBEAT_TTL_SECS", 30)?,
            scheduler_tick: millis("SCHEDULER_TICK_MS", 250)?,
            sweeper_tick: secs("SWEEPER_TICK_SECS", 5)?,
            outbox_workers: integer("OUTBOX_WORKERS", 4)?,
            outbox_batch: integer("OUTBOX_BATCH", 32)?,
            outbox_lock: secs("OUTBOX_LOCK_SECS", 60)?,
            max_attempts: integer("MAX_ATTEMPTS", 5)?,
            max_outbox_attempts: integer("MAX_OUTBOX_ATTEMPTS", 10)?,
            retry_base: secs("RETRY_BASE_SECS", 30)?,
            retry_cap: secs("RETRY_CAP_SECS", 1800)?,
            outbox_retry_base: secs("OUTBOX_RETRY_BASE_SECS", 5)?,
            outbox_retry_cap: secs("OUTBOX_RETRY_CAP_SECS", 600)?,
            outbox_poll: millis("OUTBOX_POLL_MS", 1000)?,
            queue_caps,
            default_queue_cap: integer("QUEUE_CAP_DEFAULT", 2)?,
        })
    }

    /// Job re-claim backoff policy.
    pub fn job_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: self.retry_base,
            cap: self.retry_cap,
            ..RetryPolicy::job_default()
        }
    }

    /// Webhook redelivery backoff policy.
    pub fn outbox_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_outbox_attempts,
            base: self.outbox_retry_base,
            cap: self.outbox_retry_cap,
            ..RetryPolicy::outbox_default()
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            webhook_urls: Vec::new(),
            webhook_secret: String::new(),
            webhook_timeout: Duration::from_secs(10),
            lease: Duration::from_secs(120),
            lock_grace: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(30),
            scheduler_tick: Duration::from_millis(250),
            sweeper_tick: Duration::from_secs(5),
            outbox_workers: 4,
            outbox_batch: 32,
            outbox_lock: Duration::from_secs(60),
            max_attempts: 5,
            max_outbox_attempts: 10,
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(1800),
            outbox_retry_base: Duration::from_secs(5),
            outbox_retry_cap: Duration::from_secs(600),
            outbox_poll: Duration::from_millis(1000),
            queue_caps: HashMap::from([
                ("default".to_string(), 2),
                ("gpu_queue".to_string(), 2),
                ("training_queue".to_string(), 1),
                ("agent_queue".to_string(), 2),
            ]),
            default_queue_cap: 2,
        }
    }
}

fn secs(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_env(key, default)?))
}

fn millis(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parse_env(key, default)?))
}

fn integer<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_env(key, default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("invalid {key}: {v}")),
        Err(_) => Ok(default),
    }
}
