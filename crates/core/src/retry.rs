//! Retry policy with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff configuration.
///
/// Delay for attempt `n` (1-indexed) is `min(cap, base * 2^(n-1))`, widened
/// by up to `jitter` in either direction. The offset is mixed from the
/// caller's seed and the attempt number rather than drawn from a RNG, so a
/// given job's schedule is stable across sweeps while different jobs do not
/// line up on the same instants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which the failure becomes terminal.
    pub max_attempts: i32,
    pub base: Duration,
    pub cap: Duration,
    /// Jitter factor in `[0.0, 1.0]`; 0 disables jitter.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Job re-claim backoff after a transient failure or lease expiry.
    pub fn job_default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(30 * 60),
            jitter: 0.0,
        }
    }

    /// Webhook redelivery backoff.
    pub fn outbox_default() -> Self {
        Self {
            max_attempts: 10,
            base: Duration::from_secs(5),
            cap: Duration::from_secs(10 * 60),
            jitter: 0.2,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` completed
    /// failures (so the first retry passes `attempt = 1`). `seed` is the
    /// jittered schedule's identity, normally the job or outbox row id.
    pub fn delay_for_attempt(&self, attempt: i32, seed: u64) -> Duration {
        if attempt <= 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;
        let exp = 2_f64.powi((attempt - 1).min(30));
        let delay_ms = (base_ms * exp).min(cap_ms);

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let unit = mix_to_unit(seed, attempt);
            jitter_range * (unit * 2.0 - 1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: i32) -> bool {
        attempt < self.max_attempts
    }
}

/// Splitmix-style finalizer over `(seed, attempt)`, mapped into `[0, 1)`.
fn mix_to_unit(seed: u64, attempt: i32) -> f64 {
    let mut h = seed ^ (attempt as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    (h >> 11) as f64 / (1u64 << 53) as f64
}
