//! Retry policy: decides backoff delays.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with a cap and jitter.
///
/// Delay for attempt `n` (1-indexed, after the n-th failure):
/// `min(base * 2^n, cap)`, then jittered uniformly into the upper half of
/// that value so synchronized failures do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.base_secs),
            Duration::from_secs(cfg.cap_secs),
            cfg.max_attempts,
        )
    }

    /// Capped exponential delay, before jitter.
    fn raw_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base.as_secs_f64();
        let exp = base_secs * 2f64.powi(attempts.min(62) as i32);
        Duration::from_secs_f64(exp.min(self.cap.as_secs_f64()))
    }

    /// Delay before the next retry after `attempts` failures.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let raw = self.raw_delay(attempts);
        let raw_secs = raw.as_secs_f64();
        let jittered = rand::thread_rng().gen_range((raw_secs / 2.0)..=raw_secs);
        Duration::from_secs_f64(jittered)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
