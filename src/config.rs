// src/config.rs
use std::time::Duration;

use crate::error::ConfigError;
use crate::utils::constants::{
    DEFAULT_BACKOFF,
    DEFAULT_CONCURRENCY,
    DEFAULT_KEY_PREFIX,
    DEFAULT_LEASE_DURATION,
    DEFAULT_MAX_ATTEMPTS,
    DEFAULT_POLL_INTERVAL,
    DEFAULT_QUEUE_NAME,
    DEFAULT_RENEWAL_INTERVAL,
    DEFAULT_STALL_CHECK_INTERVAL,
    MAX_STALLED_COUNT,
};

/// Runtime settings for one worker process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Jobs allowed to execute at once.
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub renewal_interval: Duration,
    pub stall_check_interval: Duration,
    /// Stalls tolerated before a job is failed. Zero means fail on first stall.
    pub max_stalled: u32,
    /// Idle wait between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound on how long a drain waits for in-flight jobs.
    pub drain_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            lease_duration: DEFAULT_LEASE_DURATION,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            stall_check_interval: DEFAULT_STALL_CHECK_INTERVAL,
            max_stalled: MAX_STALLED_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: None,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        for (name, value) in [
            ("lease duration", self.lease_duration),
            ("renewal interval", self.renewal_interval),
            ("stall check interval", self.stall_check_interval),
            ("poll interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.renewal_interval >= self.lease_duration {
            return Err(ConfigError::RenewalNotShorterThanLease {
                renewal: self.renewal_interval,
                lease: self.lease_duration,
            });
        }
        Ok(())
    }
}

/// Retry contract enforced by the queue, not by handlers.
#[derive(Clone, Debug)]
pub struct QueuePolicy {
    pub prefix: String,
    pub queue: String,
    /// Total attempts including the first; 1 disables retries.
    pub max_attempts: u32,
    /// Base delay, doubled for every attempt already made.
    pub backoff: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            queue: DEFAULT_QUEUE_NAME.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl QueuePolicy {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    /// Delay before the next attempt after `attempts` have been made.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }

    /// Whether a retryable failure on attempt `attempts` goes back to the queue.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
