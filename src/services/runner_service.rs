// src/services/runner_service.rs
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{watch, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, QueueError};
use crate::events::{EventBus, WorkerEvent};
use crate::job::{Job, JobFailure};
use crate::queue::{FailDisposition, JobQueue};
use crate::services::lease_service::{Lease, LeasePolicy};
use crate::services::metrics_service::{
    spawn_event_reporter, WorkerMetrics, STATUS_COMPLETED, STATUS_FAILED,
};
use crate::services::stall_service::StallDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Open,
    Paused,
    Closed,
}

/// One occupied execution slot. Dropping it frees the slot.
struct Slot {
    active: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    fn occupy(active: Arc<AtomicUsize>, permit: OwnedSemaphorePermit) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active,
            _permit: permit,
        }
    }
}

impl Drop for Slot {
    // Runs before the permit is released, so a drain waiting on permits
    // never observes a stale active count.
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The queue-consuming side of the process.
///
/// Claims jobs while execution slots are free, keeps each job's lease alive
/// while its handler runs, records the outcome, and drains cleanly.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<WorkerMetrics>,
    events: EventBus,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    admission: watch::Sender<Admission>,
    shutdown: CancellationToken,
    reporter_stop: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    drained: OnceCell<()>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<WorkerMetrics>,
        config: WorkerConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (admission, _) = watch::channel(Admission::Open);

        Ok(Arc::new(Self {
            queue,
            dispatcher,
            metrics,
            events: EventBus::default(),
            slots: Arc::new(Semaphore::new(config.concurrency)),
            active: Arc::new(AtomicUsize::new(0)),
            admission,
            shutdown: CancellationToken::new(),
            reporter_stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            reporter: Mutex::new(None),
            drained: OnceCell::new(),
            config,
        }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Jobs currently holding an execution slot.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.admission.borrow() != Admission::Open
    }

    /// Spawn the event reporter, the stall detector and the claim loop.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(target: "worker", "worker already started");
            return;
        }

        let reporter = spawn_event_reporter(self.events.subscribe(), self.reporter_stop.clone());
        *self.reporter.lock().unwrap_or_else(PoisonError::into_inner) = Some(reporter);

        let stall = StallDetector::new(
            self.queue.clone(),
            self.events.clone(),
            self.metrics.clone(),
            self.config.stall_check_interval,
            self.config.max_stalled,
        )
        .spawn(self.shutdown.clone());
        let claim = tokio::spawn(Arc::clone(self).claim_loop());

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([stall, claim]);

        info!(
            target: "worker",
            concurrency = self.config.concurrency,
            lease = ?self.config.lease_duration,
            renewal = ?self.config.renewal_interval,
            "🚀 worker started"
        );
    }

    /// Enqueue a job through this worker's queue.
    pub async fn submit(&self, payload: Value) -> Result<String, QueueError> {
        let job_id = self.queue.enqueue(payload).await?;
        self.events.emit(WorkerEvent::Waiting {
            job_id: job_id.clone(),
        });
        Ok(job_id)
    }

    /// Stop admitting new jobs; running jobs are unaffected.
    pub fn pause(&self) -> bool {
        let changed = self.admission.send_if_modified(|state| {
            if *state == Admission::Open {
                *state = Admission::Paused;
                true
            } else {
                false
            }
        });
        if changed {
            self.events.emit(WorkerEvent::Paused);
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = self.admission.send_if_modified(|state| {
            if *state == Admission::Paused {
                *state = Admission::Open;
                true
            } else {
                false
            }
        });
        if changed {
            self.events.emit(WorkerEvent::Resumed);
        }
        changed
    }

    /// Sample the queue depth and publish it.
    pub async fn health_check(&self) -> Result<u64, QueueError> {
        match self.queue.count().await {
            Ok(depth) => {
                self.metrics.set_queue_depth(depth);
                info!(target: "worker", depth, active = self.active_jobs(), "health check");
                Ok(depth)
            }
            Err(err) => {
                self.events.emit(WorkerEvent::Error {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Stop admitting, wait for in-flight jobs, then close the queue.
    ///
    /// Safe to call more than once; every caller waits for the same drain.
    pub async fn drain(&self) -> Result<(), QueueError> {
        self.drained
            .get_or_try_init(|| self.drain_inner())
            .await
            .map(|_| ())
    }

    async fn drain_inner(&self) -> Result<(), QueueError> {
        let previous = self.admission.send_replace(Admission::Closed);
        if previous == Admission::Open {
            self.events.emit(WorkerEvent::Paused);
        }
        info!(target: "worker", active = self.active_jobs(), "draining worker");

        // Every permit back in the pool means no job is running.
        let capacity = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let idle = self.slots.acquire_many(capacity);
        match self.config.drain_timeout {
            Some(limit) => {
                if timeout(limit, idle).await.is_err() {
                    warn!(
                        target: "worker",
                        active = self.active_jobs(),
                        ?limit,
                        "drain timeout reached with jobs still running"
                    );
                }
            }
            None => {
                let _ = idle.await;
            }
        }
        self.slots.close();

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                warn!(target: "worker", error = %err, "background task ended abnormally");
            }
        }

        let closed = self.queue.close().await;
        info!(target: "worker", "queue closed");

        self.reporter_stop.cancel();
        let reporter = self.reporter.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        closed
    }

    fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            duration: self.config.lease_duration,
            renewal_interval: self.config.renewal_interval,
        }
    }

    async fn claim_loop(self: Arc<Self>) {
        let mut admission = self.admission.subscribe();

        loop {
            let state = match admission.wait_for(|state| *state != Admission::Paused).await {
                Ok(state) => *state,
                Err(_) => Admission::Closed,
            };
            if state == Admission::Closed {
                break;
            }

            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_closed(&mut admission) => break,
            };

            // Paused or closed while waiting for a slot.
            if *admission.borrow() != Admission::Open {
                drop(permit);
                continue;
            }

            match self.queue.claim_next(self.config.lease_duration).await {
                Ok(Some(job)) => self.admit(job, permit),
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut admission).await;
                }
                Err(err) => {
                    drop(permit);
                    warn!(target: "worker", error = %err, "claim failed");
                    self.events.emit(WorkerEvent::Error {
                        error: err.to_string(),
                    });
                    self.idle(&mut admission).await;
                }
            }
        }

        info!(target: "worker", "claim loop stopped");
    }

    async fn idle(&self, admission: &mut watch::Receiver<Admission>) {
        tokio::select! {
            _ = sleep(self.config.poll_interval) => {}
            _ = wait_closed(admission) => {}
        }
    }

    fn admit(self: &Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let slot = Slot::occupy(self.active.clone(), permit);
        self.events.emit(WorkerEvent::Active {
            job_id: job.id.clone(),
            attempts: job.attempts,
        });

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let _slot = slot;
            worker.process(job).await;
        });
    }

    async fn process(&self, job: Job) {
        let started = Instant::now();
        let lease = Lease::acquire(
            self.queue.clone(),
            job.clone(),
            self.lease_policy(),
            self.events.clone(),
        );

        let outcome = self.dispatcher.dispatch(&job).await;
        let report = lease.release().await;
        let duration = started.elapsed();
        if report.lost {
            warn!(target: "worker", job_id = %job.id, "job finished after losing its lease");
        }

        match outcome {
            Ok(result) => match self.queue.mark_completed(&job, &result).await {
                Ok(()) => {
                    self.metrics.record_job(STATUS_COMPLETED);
                    self.events.emit(WorkerEvent::Completed {
                        job_id: job.id,
                        result,
                        duration,
                    });
                }
                Err(err) => self.commit_failed(&job, err),
            },
            Err(err) => {
                let failure = JobFailure {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                };
                match self.queue.mark_failed(&job, &failure).await {
                    Ok(disposition) => {
                        self.metrics.record_job(STATUS_FAILED);
                        self.events.emit(WorkerEvent::Failed {
                            job_id: job.id,
                            error: failure.message,
                            retrying: matches!(disposition, FailDisposition::Retrying { .. }),
                            duration: Some(duration),
                        });
                    }
                    Err(err) => self.commit_failed(&job, err),
                }
            }
        }
    }

    fn commit_failed(&self, job: &Job, err: QueueError) {
        match err {
            QueueError::LeaseLost { .. } => {
                warn!(target: "worker", job_id = %job.id, "result discarded, lease no longer held");
            }
            err => {
                error!(target: "worker", job_id = %job.id, error = %err, "could not record job outcome");
                self.events.emit(WorkerEvent::Error {
                    error: err.to_string(),
                });
            }
        }
    }
}

async fn wait_closed(admission: &mut watch::Receiver<Admission>) {
    let _ = admission.wait_for(|state| *state == Admission::Closed).await;
}
