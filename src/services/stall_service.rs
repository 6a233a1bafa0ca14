// src/services/stall_service.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, WorkerEvent};
use crate::queue::JobQueue;
use crate::services::metrics_service::{WorkerMetrics, STATUS_FAILED};
use crate::utils::constants::STALLED_ERROR;

/// Periodically sweeps the queue for jobs whose lease ran out.
///
/// Runs apart from any handler, so a hung or crashed worker's job is still
/// found. With `max_stalled == 0` every stalled job is failed outright.
pub struct StallDetector {
    queue: Arc<dyn JobQueue>,
    events: EventBus,
    metrics: Arc<WorkerMetrics>,
    check_interval: Duration,
    max_stalled: u32,
}

impl StallDetector {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        events: EventBus,
        metrics: Arc<WorkerMetrics>,
        check_interval: Duration,
        max_stalled: u32,
    ) -> Self {
        Self {
            queue,
            events,
            metrics,
            check_interval,
            max_stalled,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(target: "stall", interval = ?self.check_interval, max_stalled = self.max_stalled, "🕐 stall detector started");
            let mut tick = interval(self.check_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                self.sweep().await;
            }
            info!(target: "stall", "🕐 stall detector stopped");
        })
    }

    /// One pass over expired leases.
    pub async fn sweep(&self) {
        let reaped = match self.queue.reap_stalled(self.max_stalled).await {
            Ok(reaped) => reaped,
            Err(err) => {
                warn!(target: "stall", error = %err, "stall check failed");
                self.events.emit(WorkerEvent::Error {
                    error: err.to_string(),
                });
                return;
            }
        };

        for stalled in reaped {
            self.events.emit(WorkerEvent::Stalled {
                job_id: stalled.job_id.clone(),
            });
            if stalled.failed {
                self.metrics.record_job(STATUS_FAILED);
                self.events.emit(WorkerEvent::Failed {
                    job_id: stalled.job_id,
                    error: STALLED_ERROR.to_string(),
                    retrying: false,
                    duration: None,
                });
            } else {
                debug!(target: "stall", job_id = %stalled.job_id, "stalled job returned to wait list");
            }
        }
    }
}
