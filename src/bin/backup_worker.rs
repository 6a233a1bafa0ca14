// src/bin/backup_worker.rs
//
// backup-worker: consumes backup jobs from Redis until SIGINT/SIGTERM, then
// drains.
//
// Example:
//   backup-worker --redis redis://127.0.0.1:6379 --queue backup \
//     --backup-cmd "/opt/backup/run" --init-cmd "/opt/backup/discover"

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use backup_worker::handlers::command::{CommandBackup, CommandInitializer, CommandSpec};
use backup_worker::utils::constants::{
    DEFAULT_BACKUP_CONCURRENCY,
    DEFAULT_CONCURRENCY,
    DEFAULT_HEALTH_INTERVAL,
    DEFAULT_KEY_PREFIX,
    DEFAULT_QUEUE_NAME,
    DEFAULT_READ_PREFERENCE,
    MAX_STALLED_COUNT,
};
use backup_worker::routes::metrics_route::serve_metrics;
use backup_worker::utils::logging::init_tracing;
use backup_worker::{Dispatcher, QueuePolicy, RedisQueue, Worker, WorkerConfig, WorkerMetrics};

#[derive(Parser, Debug)]
#[command(name = "backup-worker", version, about = "Backup job queue worker")]
struct Args {
    /// Redis connection URL. Falls back to REDIS_URL, then the local default.
    #[arg(long, env = "BACKUP_WORKER_REDIS_URL")]
    redis: Option<String>,

    /// Queue to consume
    #[arg(long, env = "BACKUP_WORKER_QUEUE", default_value = DEFAULT_QUEUE_NAME)]
    queue: String,

    /// Redis key prefix
    #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
    prefix: String,

    /// Jobs executed at once
    #[arg(long, env = "BACKUP_WORKER_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Lease duration in seconds
    #[arg(long, default_value_t = 15 * 60)]
    lease_secs: u64,

    /// Lease renewal period in seconds
    #[arg(long, default_value_t = 60)]
    renew_secs: u64,

    /// Stall check period in seconds
    #[arg(long, default_value_t = 30)]
    stall_check_secs: u64,

    /// Attempts per job before it stays failed
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,

    /// Base retry backoff in seconds
    #[arg(long, default_value_t = 10)]
    backoff_secs: u64,

    /// Give up waiting for in-flight jobs after this many seconds
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Health check period in seconds
    #[arg(long, default_value_t = DEFAULT_HEALTH_INTERVAL.as_secs())]
    health_secs: u64,

    /// Program run per project: `<cmd> <projectId>`
    #[arg(long, env = "BACKUP_WORKER_BACKUP_CMD")]
    backup_cmd: String,

    /// Program run per date range: `<cmd> <startDate> <endDate>`
    #[arg(long, env = "BACKUP_WORKER_INIT_CMD")]
    init_cmd: String,

    /// Parallel units inside a single project backup
    #[arg(long, default_value_t = DEFAULT_BACKUP_CONCURRENCY)]
    backup_concurrency: usize,

    /// Replica read preference for the backup program
    #[arg(long, default_value = DEFAULT_READ_PREFERENCE)]
    read_preference: String,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9100
    #[arg(long, env = "BACKUP_WORKER_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Emit JSON logs
    #[arg(long, default_value_t)]
    log_json: bool,
}

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// `--redis` (or its env var) wins over a bare `REDIS_URL`.
fn resolve_redis_url(explicit: Option<String>, redis_url_env: Option<String>) -> String {
    explicit
        .or(redis_url_env)
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())
}

impl Args {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            lease_duration: Duration::from_secs(self.lease_secs),
            renewal_interval: Duration::from_secs(self.renew_secs),
            stall_check_interval: Duration::from_secs(self.stall_check_secs),
            max_stalled: MAX_STALLED_COUNT,
            drain_timeout: self.drain_timeout_secs.map(Duration::from_secs),
            ..WorkerConfig::default()
        }
    }

    fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            prefix: self.prefix.clone(),
            queue: self.queue.clone(),
            max_attempts: self.max_attempts,
            backoff: Duration::from_secs(self.backoff_secs),
        }
    }
}

async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("Received SIGTERM");
                    return;
                }
            }
            std::future::pending::<()>().await
        } => {}
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // Load .env if present
    let dotenv = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(args.log_json);

    match dotenv {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(e) => warn!(error = %e, ".env not loaded"),
    }

    let redis_url = resolve_redis_url(args.redis.clone(), std::env::var("REDIS_URL").ok());

    let config = args.worker_config();
    config.validate()?;
    let policy = args.queue_policy();
    policy.validate()?;

    let backup = CommandBackup {
        spec: CommandSpec::parse(&args.backup_cmd).ok_or_else(|| anyhow!("--backup-cmd is empty"))?,
        concurrency: args.backup_concurrency,
        read_preference: args.read_preference.clone(),
    };
    let initializer = CommandInitializer {
        spec: CommandSpec::parse(&args.init_cmd).ok_or_else(|| anyhow!("--init-cmd is empty"))?,
    };

    info!(queue = %policy.queue, concurrency = config.concurrency, "Starting backup-worker");

    let queue = Arc::new(
        RedisQueue::connect(&redis_url, policy)
            .await
            .context("connecting to redis")?,
    );
    let metrics = Arc::new(WorkerMetrics::new()?);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(backup),
        Arc::new(initializer),
        metrics.clone(),
    ));
    let exporter = match &args.metrics_addr {
        Some(addr) => {
            let server = serve_metrics(addr, metrics.clone())
                .with_context(|| format!("binding metrics exporter on {addr}"))?;
            let handle = server.handle();
            tokio::spawn(server);
            Some(handle)
        }
        None => None,
    };

    let worker = Worker::new(queue, dispatcher, metrics, config)?;
    worker.start();

    let health = {
        let worker = worker.clone();
        let period = Duration::from_secs(args.health_secs.max(1));
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(err) = worker.health_check().await {
                    warn!(error = %err, "health check failed");
                }
            }
        })
    };

    info!("backup-worker running. Press Ctrl+C to stop.");
    wait_for_signal().await;

    health.abort();
    worker.drain().await.context("draining worker")?;
    if let Some(exporter) = exporter {
        exporter.stop(true).await;
    }

    info!("backup-worker exited");
    Ok(())
}
