//! Outbox delivery workers.
//!
//! Each worker claims a batch of due rows under a row lock, POSTs the
//! envelope to every configured subscriber, and acks the row: delivered on
//! 2xx everywhere, failed permanently on any 4xx, rescheduled with backoff
//! on 5xx, network errors and timeouts. Rows carry their id as an
//! `Idempotency-Key` header so subscribers can dedupe redeliveries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use conductor_core::{CoreResult, OutboxRow, RetryPolicy};
use conductor_store::Store;

use crate::signer::sign_payload;

const ERROR_PREFIX_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Subscriber endpoints; a row is delivered once all of them accept it.
    pub urls: Vec<String>,
    /// HMAC secret for `X-Signature`; empty disables signing.
    pub secret: String,
    pub timeout: Duration,
    pub batch: usize,
    pub lock: Duration,
    /// Idle sleep between empty claim rounds.
    pub poll: Duration,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            secret: String::new(),
            timeout: Duration::from_secs(10),
            batch: 32,
            lock: Duration::from_secs(60),
            poll: Duration::from_secs(1),
            workers: 4,
            retry: RetryPolicy::outbox_default(),
        }
    }
}

enum Outcome {
    Delivered,
    /// Non-retryable subscriber rejection (4xx).
    Rejected(String),
    /// 5xx, network error or timeout; retried with backoff.
    Retry(String),
}

pub struct DeliveryPool<S> {
    store: Arc<S>,
    config: DeliveryConfig,
    client: reqwest::Client,
}

impl<S: Store> DeliveryPool<S> {
    pub fn new(store: Arc<S>, config: DeliveryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            config,
            client,
        }
    }

    /// Spawn the configured number of delivery workers. No-op when no
    /// subscriber is configured; rows then accumulate as pending.
    pub fn spawn(self: Arc<Self>, claimant_prefix: &str) {
        if self.config.urls.is_empty() {
            info!("webhook delivery disabled (no subscriber urls)");
            return;
        }
        for i in 0..self.config.workers {
            let pool = self.clone();
            let claimant = format!("{claimant_prefix}/outbox-{i}");
            tokio::spawn(async move {
                pool.run_worker(claimant).await;
            });
        }
    }

    async fn run_worker(&self, claimant: String) {
        info!(claimant = %claimant, "outbox delivery worker started");
        loop {
            match self.deliver_once(&claimant).await {
                Ok(0) => tokio::time::sleep(self.config.poll).await,
                Ok(_) => {}
                Err(e) => {
                    error!(claimant = %claimant, error = %e, "outbox delivery round failed");
                    tokio::time::sleep(self.config.poll).await;
                }
            }
        }
    }

    /// Claim one batch and deliver every row in it. Returns the batch size
    /// so callers know whether to sleep.
    pub async fn deliver_once(&self, claimant: &str) -> CoreResult<usize> {
        let batch = self
            .store
            .outbox_claim_batch(self.config.batch, claimant, self.config.lock, Utc::now())
            .await?;
        let n = batch.len();
        for row in batch {
            self.deliver_row(row).await;
        }
        Ok(n)
    }

    /// Deliver one row and ack it. Ack failures are logged, not propagated:
    /// the row lock expires and the row is retried.
    async fn deliver_row(&self, row: OutboxRow) {
        let outcome = self.attempt(&row).await;
        let now = Utc::now();

        let ack = match outcome {
            Outcome::Delivered => {
                info!(outbox_id = %row.id, job_id = %row.job_id, "webhook delivered");
                self.store.outbox_mark_delivered(row.id, now).await
            }
            Outcome::Rejected(err) => {
                warn!(outbox_id = %row.id, error = %err, "webhook rejected; not retrying");
                self.store
                    .outbox_mark_failed(row.id, row.attempts + 1, &err)
                    .await
            }
            Outcome::Retry(err) => {
                let attempts = row.attempts + 1;
                if attempts >= self.config.retry.max_attempts {
                    warn!(outbox_id = %row.id, attempts, error = %err, "webhook attempts exhausted");
                    self.store.outbox_mark_failed(row.id, attempts, &err).await
                } else {
                    let delay = self
                        .config
                        .retry
                        .delay_for_attempt(attempts, row.id.jitter_seed());
                    let next = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(5));
                    warn!(
                        outbox_id = %row.id,
                        attempts,
                        next_attempt_at = %next,
                        error = %err,
                        "webhook delivery failed; rescheduled"
                    );
                    self.store
                        .outbox_reschedule(row.id, attempts, next, &err)
                        .await
                }
            }
        };

        if let Err(e) = ack {
            error!(outbox_id = %row.id, error = %e, "failed to ack outbox row");
        }
    }

    /// POST the envelope to every subscriber. The first rejection or
    /// retryable failure decides the row's fate for this round.
    async fn attempt(&self, row: &OutboxRow) -> Outcome {
        let body = row.event.to_string();
        let ts = Utc::now().timestamp();

        for url in &self.config.urls {
            let mut req = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("Idempotency-Key", row.id.to_string())
                .header("X-Timestamp", ts.to_string())
                .body(body.clone());
            if !self.config.secret.is_empty() {
                req = req.header("X-Signature", sign_payload(&self.config.secret, ts, &body));
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => continue,
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Outcome::Rejected(format!(
                        "HTTP {}: {}",
                        status,
                        prefix(&text)
                    ));
                }
                Ok(resp) => return Outcome::Retry(format!("HTTP {}", resp.status())),
                Err(e) => return Outcome::Retry(prefix(&e.to_string()).to_string()),
            }
        }
        Outcome::Delivered
    }
}

fn prefix(s: &str) -> &str {
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < ERROR_PREFIX_LEN)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &s[..end]
}
