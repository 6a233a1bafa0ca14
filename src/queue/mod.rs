// src/queue/mod.rs
//
// Boundary to the durable job store. Everything the worker needs from the
// queue goes through `JobQueue`, so the Redis store and the in-process store
// are interchangeable.

pub mod memory_queue;
pub mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueueError;
use crate::job::{Job, JobFailure};

pub use memory_queue::MemoryQueue;
pub use redis_queue::RedisQueue;

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    Failed,
    Retrying { delay: Duration },
}

/// A job whose lease expired without renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub job_id: String,
    /// True when the stall limit was exceeded and the job moved to failed.
    pub failed: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job to the back of the wait list and return its id.
    async fn enqueue(&self, payload: Value) -> Result<String, QueueError>;

    /// Atomically move the next waiting job to active under a fresh lease.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, QueueError>;

    /// Push the lease expiry of an active job `lease` into the future.
    async fn renew_lease(&self, job: &Job, lease: Duration) -> Result<(), QueueError>;

    async fn mark_completed(&self, job: &Job, result: &str) -> Result<(), QueueError>;

    async fn mark_failed(
        &self,
        job: &Job,
        failure: &JobFailure,
    ) -> Result<FailDisposition, QueueError>;

    /// Collect active jobs whose lease has expired.
    async fn reap_stalled(&self, max_stalled: u32) -> Result<Vec<StalledJob>, QueueError>;

    /// Waiting plus delayed jobs.
    async fn count(&self) -> Result<u64, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}
