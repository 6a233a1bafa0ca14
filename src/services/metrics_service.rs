// src/services/metrics_service.rs
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::WorkerEvent;
use crate::job::BackupSummary;
use crate::utils::constants::{DURATION_BUCKETS, METRICS_PREFIX};

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// Worker metrics, registered in a registry owned by this instance.
pub struct WorkerMetrics {
    registry: Registry,
    jobs_total: IntCounterVec,
    project_units_total: IntCounterVec,
    job_duration_seconds: HistogramVec,
    queue_depth: IntGauge,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new(format!("{METRICS_PREFIX}_jobs_total"), "Job outcomes by status"),
            &["status"],
        )?;
        let project_units_total = IntCounterVec::new(
            Opts::new(
                format!("{METRICS_PREFIX}_project_units_total"),
                "Per-project backup units by status",
            ),
            &["status"],
        )?;
        let job_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{METRICS_PREFIX}_job_duration_seconds"),
                "Job handler duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["kind", "status"],
        )?;
        let queue_depth = IntGauge::new(
            format!("{METRICS_PREFIX}_queue_depth"),
            "Jobs waiting or delayed in the queue",
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(project_units_total.clone()))?;
        registry.register(Box::new(job_duration_seconds.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            project_units_total,
            job_duration_seconds,
            queue_depth,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_job(&self, status: &str) {
        self.jobs_total.with_label_values(&[status]).inc();
    }

    /// Split one backup's units into succeeded and failed counts.
    pub fn record_project_units(&self, summary: &BackupSummary) {
        self.project_units_total
            .with_label_values(&[STATUS_COMPLETED])
            .inc_by(summary.succeeded());
        self.project_units_total
            .with_label_values(&[STATUS_FAILED])
            .inc_by(summary.errors);
    }

    pub fn observe_duration(&self, kind: &str, status: &str, elapsed: Duration) {
        self.job_duration_seconds
            .with_label_values(&[kind, status])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn jobs(&self, status: &str) -> u64 {
        self.jobs_total.with_label_values(&[status]).get()
    }

    pub fn project_units(&self, status: &str) -> u64 {
        self.project_units_total.with_label_values(&[status]).get()
    }

    pub fn duration_samples(&self, kind: &str, status: &str) -> u64 {
        self.job_duration_seconds
            .with_label_values(&[kind, status])
            .get_sample_count()
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Log every lifecycle event.
///
/// Once `stop` fires, events already buffered are still reported. Outcome
/// counters are recorded where the outcome is committed, not here.
pub fn spawn_event_reporter(
    mut rx: broadcast::Receiver<WorkerEvent>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = stop.cancelled() => break,
            };
            match received {
                Ok(event) => report_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "events", skipped, "event reporter lagged");
                }
                Err(RecvError::Closed) => return,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(event) => report_event(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(target: "events", skipped, "event reporter lagged");
                }
                Err(_) => break,
            }
        }
    })
}

pub fn report_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::Waiting { job_id } => {
            info!(target: "events", %job_id, "job waiting");
        }
        WorkerEvent::Active { job_id, attempts } => {
            info!(target: "events", %job_id, attempts, "job active");
        }
        WorkerEvent::Completed { job_id, result, duration } => {
            info!(target: "events", %job_id, %result, ?duration, "✅ job completed");
        }
        WorkerEvent::Failed { job_id, error, retrying, duration } => {
            error!(target: "events", %job_id, %error, retrying, ?duration, "❌ job failed");
        }
        WorkerEvent::Stalled { job_id } => {
            warn!(target: "events", %job_id, "job stalled");
        }
        WorkerEvent::LockExtensionFailed { job_id, error } => {
            error!(target: "events", %job_id, %error, "lock extension failed");
        }
        WorkerEvent::Paused => info!(target: "events", "queue paused"),
        WorkerEvent::Resumed => info!(target: "events", "queue resumed"),
        WorkerEvent::Error { error } => {
            error!(target: "events", %error, "queue error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_splits_units() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_project_units(&BackupSummary { errors: 2, completed: 10 });
        assert_eq!(metrics.project_units(STATUS_COMPLETED), 8);
        assert_eq!(metrics.project_units(STATUS_FAILED), 2);
    }

    #[test]
    fn job_outcomes_are_counted_per_status() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_job(STATUS_COMPLETED);
        metrics.record_job(STATUS_FAILED);
        metrics.record_job(STATUS_FAILED);
        assert_eq!(metrics.jobs(STATUS_COMPLETED), 1);
        assert_eq!(metrics.jobs(STATUS_FAILED), 2);

        // Reporting events only logs.
        report_event(&WorkerEvent::Completed {
            job_id: "a".into(),
            result: "ok".into(),
            duration: Duration::from_millis(5),
        });
        assert_eq!(metrics.jobs(STATUS_COMPLETED), 1);
    }

    #[test]
    fn render_uses_fixed_buckets() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.observe_duration("backup", STATUS_COMPLETED, Duration::from_millis(250));
        metrics.set_queue_depth(7);

        let text = metrics.render().unwrap();
        assert!(text.contains("backup_worker_job_duration_seconds_bucket{kind=\"backup\",status=\"completed\",le=\"0.5\"} 1"));
        assert!(text.contains("backup_worker_job_duration_seconds_bucket{kind=\"backup\",status=\"completed\",le=\"0.1\"} 0"));
        assert!(text.contains("backup_worker_queue_depth 7"));
    }
}
