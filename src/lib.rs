//! Backup job worker.
//!
//! Consumes backup and range-initialization jobs from a Redis-backed queue
//! with bounded concurrency, renewed execution leases, zero-tolerance stall
//! handling and a pause-then-close drain.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handlers;
pub mod job;
pub mod queue;
pub mod routes;
pub mod services;
pub mod utils;

pub use config::{QueuePolicy, WorkerConfig};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, JobError, QueueError};
pub use events::{EventBus, WorkerEvent};
pub use job::{BackupOptions, BackupSummary, DateRange, Job, JobPayload, JobState};
pub use queue::{JobQueue, MemoryQueue, RedisQueue};
pub use services::metrics_service::WorkerMetrics;
pub use services::runner_service::Worker;
