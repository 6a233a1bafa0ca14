// src/utils/constants.rs

use std::time::Duration;

// ---------------------------------------------------------
// Worker defaults
// ---------------------------------------------------------
pub const DEFAULT_CONCURRENCY: usize = 15;
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STALL_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Stalled jobs are failed on first detection, never re-delivered.
pub const MAX_STALLED_COUNT: u32 = 0;

// ---------------------------------------------------------
// Queue policy defaults
// ---------------------------------------------------------
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

// ---------------------------------------------------------
// Backup collaborator
// ---------------------------------------------------------
pub const DEFAULT_BACKUP_CONCURRENCY: usize = 50;
pub const DEFAULT_READ_PREFERENCE: &str = "secondaryPreferred";

// ---------------------------------------------------------
// Redis keys
// ---------------------------------------------------------
pub const DEFAULT_KEY_PREFIX: &str = "backup";
pub const DEFAULT_QUEUE_NAME: &str = "backup";

pub const SUFFIX_WAIT: &str = "wait";
pub const SUFFIX_ACTIVE: &str = "active";
pub const SUFFIX_DELAYED: &str = "delayed";
pub const SUFFIX_COMPLETED: &str = "completed";
pub const SUFFIX_FAILED: &str = "failed";
pub const SUFFIX_JOB: &str = "job";

/// Upper bound on delayed jobs promoted per claim.
pub const PROMOTE_BATCH_LIMIT: usize = 100;

// ---------------------------------------------------------
// Metrics
// ---------------------------------------------------------
pub const METRICS_PREFIX: &str = "backup_worker";

/// Resolves both no-op backups and multi-minute ones.
pub const DURATION_BUCKETS: [f64; 8] = [0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub const STALLED_ERROR: &str = "job stalled more than allowable limit";
