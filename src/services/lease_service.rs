// src/services/lease_service.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, WorkerEvent};
use crate::job::Job;
use crate::queue::JobQueue;

/// How long a claim lasts and how often it is extended.
#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    pub duration: Duration,
    pub renewal_interval: Duration,
}

/// What happened to a lease while its handler ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseReport {
    pub renewals: u32,
    /// Set once a renewal failed; the job may since have been reclaimed.
    pub lost: bool,
}

/// Keeps one job's lease alive until released.
///
/// Renewal runs on its own timer, independent of handler progress. A failed
/// renewal ends protection for this execution but never interrupts the
/// handler.
pub struct Lease {
    job_id: String,
    stop: CancellationToken,
    renewer: Option<JoinHandle<LeaseReport>>,
}

impl Lease {
    pub fn acquire(
        queue: Arc<dyn JobQueue>,
        job: Job,
        policy: LeasePolicy,
        events: EventBus,
    ) -> Self {
        let stop = CancellationToken::new();
        let job_id = job.id.clone();
        let renewer = tokio::spawn(renew_until_stopped(
            queue,
            job,
            policy,
            events,
            stop.clone(),
        ));

        Self {
            job_id,
            stop,
            renewer: Some(renewer),
        }
    }

    /// Stop renewing and report how the lease fared.
    pub async fn release(mut self) -> LeaseReport {
        self.stop.cancel();
        match self.renewer.take() {
            Some(handle) => match handle.await {
                Ok(report) => report,
                Err(err) => {
                    warn!(target: "lease", job_id = %self.job_id, error = %err, "lease renewer panicked");
                    LeaseReport { renewals: 0, lost: true }
                }
            },
            None => LeaseReport::default(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.renewer.take() {
            handle.abort();
        }
    }
}

async fn renew_until_stopped(
    queue: Arc<dyn JobQueue>,
    job: Job,
    policy: LeasePolicy,
    events: EventBus,
    stop: CancellationToken,
) -> LeaseReport {
    let mut report = LeaseReport::default();
    let mut ticker = interval_at(
        Instant::now() + policy.renewal_interval,
        policy.renewal_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.renew_lease(&job, policy.duration).await {
            Ok(()) => {
                report.renewals += 1;
                debug!(target: "lease", job_id = %job.id, renewals = report.renewals, "lease extended");
            }
            Err(err) => {
                warn!(target: "lease", job_id = %job.id, error = %err, "lease extension failed");
                events.emit(WorkerEvent::LockExtensionFailed {
                    job_id: job.id.clone(),
                    error: err.to_string(),
                });
                report.lost = true;
                break;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use serde_json::json;

    fn policy() -> LeasePolicy {
        LeasePolicy {
            duration: Duration::from_secs(15),
            renewal_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_on_cadence_while_held() {
        let queue = Arc::new(MemoryQueue::default());
        queue.enqueue(json!({ "projectId": "P1" })).await.unwrap();
        let job = queue.claim_next(policy().duration).await.unwrap().unwrap();

        let lease = Lease::acquire(queue.clone(), job.clone(), policy(), EventBus::default());
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        let report = lease.release().await;

        assert_eq!(report.renewals, 20);
        assert!(!report.lost);
        assert_eq!(queue.renewals_of(&job.id), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_is_reported_and_stops_renewing() {
        let queue = Arc::new(MemoryQueue::default());
        queue.enqueue(json!({ "projectId": "P1" })).await.unwrap();
        let job = queue.claim_next(policy().duration).await.unwrap().unwrap();
        queue.set_renewals_failing(true);

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let lease = Lease::acquire(queue.clone(), job.clone(), policy(), events);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let report = lease.release().await;
        assert!(report.lost);
        assert_eq!(report.renewals, 0);

        match rx.recv().await.unwrap() {
            WorkerEvent::LockExtensionFailed { job_id, .. } => assert_eq!(job_id, job.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
