//! Controller configuration.
//!
//! Every knob has a default; a TOML file can override any subset:
//!
//! ```toml
//! workers = 8
//! max_concurrency = 20
//!
//! [retry]
//! base_secs = 5
//! cap_secs = 300
//! max_attempts = 5
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::domain::CoreError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Worker tasks popping the ready queue.
    pub workers: usize,

    /// Global bound on in-flight tasks (`task:concurrency_lock`).
    pub max_concurrency: i64,

    /// Cadence of the delayed/retry promotion tick.
    pub promote_interval_ms: u64,

    /// Blocking-pop timeout for the ready queue.
    pub pop_timeout_ms: u64,

    /// Approximate cap on `trace:*:log` streams.
    pub stream_max_len: usize,

    /// Delay before a task waiting on a namespace is retried.
    pub namespace_retry_secs: u64,

    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrency: 20,
            promote_interval_ms: 1_000,
            pop_timeout_ms: 1_000,
            stream_max_len: 10_000,
            namespace_retry_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: 5,
            cap_secs: 300,
            max_attempts: 5,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        toml::from_str(raw).map_err(|e| CoreError::validation(format!("config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::validation(format!("config {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn namespace_retry_delay(&self) -> Duration {
        Duration::from_secs(self.namespace_retry_secs)
    }
}
