// src/dispatcher.rs
use std::sync::Arc;

use tracing::warn;

use crate::error::JobError;
use crate::handlers::backup::run_backup;
use crate::handlers::initialize::run_initialize;
use crate::handlers::{ProjectBackup, ProjectInitializer};
use crate::job::{Job, JobPayload};
use crate::services::metrics_service::WorkerMetrics;

/// Routes a claimed job to exactly one handler based on its payload shape.
pub struct Dispatcher {
    backup: Arc<dyn ProjectBackup>,
    initializer: Arc<dyn ProjectInitializer>,
    metrics: Arc<WorkerMetrics>,
}

impl Dispatcher {
    pub fn new(
        backup: Arc<dyn ProjectBackup>,
        initializer: Arc<dyn ProjectInitializer>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            backup,
            initializer,
            metrics,
        }
    }

    pub async fn dispatch(&self, job: &Job) -> Result<String, JobError> {
        match JobPayload::classify(&job.payload) {
            JobPayload::Backup { project_id } => {
                run_backup(self.backup.as_ref(), &self.metrics, &job.id, &project_id).await
            }
            JobPayload::Initialize(range) => {
                run_initialize(self.initializer.as_ref(), &self.metrics, &job.id, range).await
            }
            JobPayload::Invalid(payload) => {
                warn!(target: "dispatcher", job_id = %job.id, %payload, "invalid job data");
                Err(JobError::InvalidJobData(payload.to_string()))
            }
        }
    }
}
