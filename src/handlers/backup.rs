// src/handlers/backup.rs
use std::time::Instant;

use tracing::{error, info};

use crate::error::JobError;
use crate::handlers::ProjectBackup;
use crate::job::BackupOptions;
use crate::services::metrics_service::{WorkerMetrics, STATUS_COMPLETED, STATUS_FAILED};

pub const KIND: &str = "backup";

pub fn summary_line(project_id: &str, errors: u64, completed: u64) -> String {
    format!("backup completed {project_id} ({errors} failed in {completed} projects)")
}

/// Run one project backup and translate it into a job result.
///
/// Sub-unit failures only move the metrics; the job itself still completes.
pub async fn run_backup(
    backup: &dyn ProjectBackup,
    metrics: &WorkerMetrics,
    job_id: &str,
    project_id: &str,
) -> Result<String, JobError> {
    let started = Instant::now();
    info!(target: "dispatcher", %job_id, %project_id, "starting project backup");

    match backup.backup_project(project_id, &BackupOptions::default()).await {
        Ok(summary) => {
            metrics.record_project_units(&summary);
            metrics.observe_duration(KIND, STATUS_COMPLETED, started.elapsed());
            Ok(summary_line(project_id, summary.errors, summary.completed))
        }
        Err(source) => {
            metrics.observe_duration(KIND, STATUS_FAILED, started.elapsed());
            error!(target: "dispatcher", %job_id, %project_id, error = %format!("{source:#}"), "project backup failed");
            Err(JobError::Backup {
                project_id: project_id.to_string(),
                source,
            })
        }
    }
}
