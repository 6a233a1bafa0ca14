// src/handlers/initialize.rs
use std::time::Instant;

use tracing::{error, info};

use crate::error::JobError;
use crate::handlers::ProjectInitializer;
use crate::job::DateRange;
use crate::services::metrics_service::{WorkerMetrics, STATUS_COMPLETED, STATUS_FAILED};

pub const KIND: &str = "initialize";

pub async fn run_initialize(
    initializer: &dyn ProjectInitializer,
    metrics: &WorkerMetrics,
    job_id: &str,
    range: DateRange,
) -> Result<String, JobError> {
    let started = Instant::now();
    info!(
        target: "dispatcher",
        %job_id,
        start_date = %range.start_date,
        end_date = %range.end_date,
        "starting initialization"
    );

    match initializer.initialize_projects(&range).await {
        Ok(()) => {
            metrics.observe_duration(KIND, STATUS_COMPLETED, started.elapsed());
            Ok(format!("initialization completed {range}"))
        }
        Err(source) => {
            metrics.observe_duration(KIND, STATUS_FAILED, started.elapsed());
            error!(
                target: "dispatcher",
                %job_id,
                start_date = %range.start_date,
                end_date = %range.end_date,
                error = %format!("{source:#}"),
                "initialization failed"
            );
            Err(JobError::Initialize { range, source })
        }
    }
}
