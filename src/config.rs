use crate::scheduler::{RetryPolicy, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid engine configuration: {0}")]
pub struct ConfigError(pub String);

/// Tunables for one [`UploadEngine`](crate::engine::UploadEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_chunks: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    pub part_timeout: Duration,
    /// Minimum byte coverage at which an interrupted upload is finalized
    /// without the original file.
    pub resume_completion_threshold: f64,
    pub session_max_age: Duration,
    pub reap_interval: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_concurrent_chunks: 3,
            max_attempts: retry.max_attempts,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            max_jitter: retry.max_jitter,
            part_timeout: Duration::from_secs(120),
            resume_completion_threshold: 0.95,
            session_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            reap_interval: Duration::from_secs(60 * 60),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Preset for clients with little bandwidth or memory to spare.
    pub fn constrained() -> Self {
        Self {
            max_concurrent_chunks: 2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_chunks == 0 {
            return Err(ConfigError("max_concurrent_chunks must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError("max_attempts must be at least 1".into()));
        }
        if !(self.resume_completion_threshold > 0.0 && self.resume_completion_threshold <= 1.0) {
            return Err(ConfigError(format!(
                "resume_completion_threshold must be in (0, 1], got {}",
                self.resume_completion_threshold
            )));
        }
        if self.part_timeout.is_zero() {
            return Err(ConfigError("part_timeout must be positive".into()));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError("reap_interval must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            max_jitter: self.max_jitter,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_chunks: self.max_concurrent_chunks,
            retry: self.retry_policy(),
            part_timeout: self.part_timeout,
        }
    }
}
