// src/error.rs
use std::time::Duration;

use thiserror::Error;

use crate::job::DateRange;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("payload serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: String },

    #[error("job {job_id} is already leased")]
    AlreadyLeased { job_id: String },

    #[error("queue is closed")]
    Closed,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job data: {0}")]
    InvalidJobData(String),

    #[error("backup failed for project {project_id}: {source:#}")]
    Backup {
        project_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("initialization failed for {range}: {source:#}")]
    Initialize {
        range: DateRange,
        #[source]
        source: anyhow::Error,
    },
}

impl JobError {
    /// Malformed payloads never had side effects, so retrying them is pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::InvalidJobData(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("renewal interval {renewal:?} must be shorter than lease duration {lease:?}")]
    RenewalNotShorterThanLease { renewal: Duration, lease: Duration },

    #[error("max attempts must be at least 1")]
    ZeroAttempts,
}
