use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::sleep;

use backup_worker::handlers::{ProjectBackup, ProjectInitializer};
use backup_worker::services::metrics_service::{STATUS_COMPLETED, STATUS_FAILED};
use backup_worker::{
    BackupOptions, BackupSummary, ConfigError, DateRange, Dispatcher, JobQueue, JobState,
    MemoryQueue, QueuePolicy, Worker, WorkerConfig, WorkerEvent, WorkerMetrics,
};

struct FakeBackup {
    delay: Duration,
    summary: BackupSummary,
    fail: bool,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeBackup {
    fn new(delay: Duration, summary: BackupSummary) -> Arc<Self> {
        Arc::new(Self {
            delay,
            summary,
            fail: false,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn failing(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            summary: BackupSummary::default(),
            fail: true,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProjectBackup for FakeBackup {
    async fn backup_project(
        &self,
        project_id: &str,
        _options: &BackupOptions,
    ) -> anyhow::Result<BackupSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            anyhow::bail!("snapshot store unreachable for {project_id}");
        }
        Ok(self.summary)
    }
}

#[derive(Default)]
struct FakeInitializer {
    ranges: Mutex<Vec<DateRange>>,
}

#[async_trait]
impl ProjectInitializer for FakeInitializer {
    async fn initialize_projects(&self, range: &DateRange) -> anyhow::Result<()> {
        self.ranges.lock().unwrap().push(range.clone());
        Ok(())
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 15,
        lease_duration: Duration::from_secs(15),
        renewal_interval: Duration::from_secs(1),
        stall_check_interval: Duration::from_secs(1),
        max_stalled: 0,
        poll_interval: Duration::from_millis(100),
        drain_timeout: None,
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    backup: Arc<FakeBackup>,
    initializer: Arc<FakeInitializer>,
    worker: Arc<Worker>,
}

fn harness(queue: MemoryQueue, backup: Arc<FakeBackup>, config: WorkerConfig) -> Harness {
    let queue = Arc::new(queue);
    let initializer = Arc::new(FakeInitializer::default());
    let metrics = Arc::new(WorkerMetrics::new().unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        backup.clone(),
        initializer.clone(),
        metrics.clone(),
    ));
    let worker = Worker::new(queue.clone(), dispatcher, metrics, config).unwrap();
    Harness {
        queue,
        backup,
        initializer,
        worker,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn drain_events(rx: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn backup_job_end_to_end() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_millis(50), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    let id = h.worker.submit(json!({ "projectId": "P1" })).await.unwrap();
    h.worker.start();

    wait_until("completion", || h.queue.state_of(&id) == Some(JobState::Completed)).await;
    assert_eq!(
        h.queue.result_of(&id).as_deref(),
        Some("backup completed P1 (0 failed in 1 projects)")
    );

    h.worker.drain().await.unwrap();
    assert_eq!(h.worker.metrics().jobs(STATUS_COMPLETED), 1);
    assert_eq!(h.worker.metrics().project_units(STATUS_COMPLETED), 1);
}

#[tokio::test(start_paused = true)]
async fn outcomes_are_counted_when_committed() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_millis(10), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    h.worker.submit(json!({ "projectId": "P1" })).await.unwrap();
    h.worker.submit(json!({ "projectId": "P2" })).await.unwrap();
    h.worker.submit(json!({})).await.unwrap();
    h.worker.start();

    let metrics = h.worker.metrics().clone();
    wait_until("outcome counters", || {
        metrics.jobs(STATUS_COMPLETED) == 2 && metrics.jobs(STATUS_FAILED) == 1
    })
    .await;
    h.worker.drain().await.unwrap();

    assert_eq!(metrics.jobs(STATUS_COMPLETED), 2);
    assert_eq!(metrics.jobs(STATUS_FAILED), 1);
}

#[tokio::test(start_paused = true)]
async fn initialization_job_end_to_end() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::ZERO, BackupSummary::default()),
        test_config(),
    );
    let id = h
        .worker
        .submit(json!({ "startDate": "2024-01-01", "endDate": "2024-01-31" }))
        .await
        .unwrap();
    h.worker.start();

    wait_until("completion", || h.queue.state_of(&id) == Some(JobState::Completed)).await;
    assert_eq!(
        h.queue.result_of(&id).as_deref(),
        Some("initialization completed 2024-01-01 - 2024-01-31")
    );
    assert_eq!(h.backup.calls(), 0);
    assert_eq!(h.initializer.ranges.lock().unwrap().len(), 1);
    h.worker.drain().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn empty_payload_fails_without_retry_or_side_effects() {
    let policy = QueuePolicy {
        max_attempts: 3,
        ..QueuePolicy::default()
    };
    let h = harness(
        MemoryQueue::new(policy),
        FakeBackup::new(Duration::ZERO, BackupSummary::default()),
        test_config(),
    );
    let mut rx = h.worker.events().subscribe();
    let id = h.worker.submit(json!({})).await.unwrap();
    h.worker.start();

    wait_until("failure", || h.queue.state_of(&id) == Some(JobState::Failed)).await;
    h.worker.drain().await.unwrap();

    assert!(h.queue.error_of(&id).unwrap().starts_with("invalid job data"));
    assert_eq!(h.queue.claims_of(&id), 1);
    assert_eq!(h.backup.calls(), 0);
    assert!(h.initializer.ranges.lock().unwrap().is_empty());

    let failed: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, WorkerEvent::Failed { .. }))
        .collect();
    assert!(matches!(
        failed.as_slice(),
        [WorkerEvent::Failed { retrying: false, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn partial_failure_is_a_completed_job() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_millis(10), BackupSummary { errors: 2, completed: 10 }),
        test_config(),
    );
    let id = h.worker.submit(json!({ "projectId": "P2" })).await.unwrap();
    h.worker.start();

    wait_until("completion", || h.queue.state_of(&id) == Some(JobState::Completed)).await;
    h.worker.drain().await.unwrap();

    let metrics = h.worker.metrics();
    assert_eq!(metrics.project_units(STATUS_COMPLETED), 8);
    assert_eq!(metrics.project_units(STATUS_FAILED), 2);
    assert_eq!(metrics.jobs(STATUS_COMPLETED), 1);
    assert_eq!(metrics.jobs(STATUS_FAILED), 0);
    assert_eq!(
        h.queue.result_of(&id).as_deref(),
        Some("backup completed P2 (2 failed in 10 projects)")
    );
}

#[tokio::test(start_paused = true)]
async fn long_job_keeps_its_lease() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_secs(20), BackupSummary { errors: 0, completed: 3 }),
        test_config(),
    );
    let mut rx = h.worker.events().subscribe();
    let id = h.worker.submit(json!({ "projectId": "P3" })).await.unwrap();
    h.worker.start();

    wait_until("completion", || h.queue.state_of(&id) == Some(JobState::Completed)).await;
    h.worker.drain().await.unwrap();

    assert!(h.queue.renewals_of(&id) >= 19, "renewals: {}", h.queue.renewals_of(&id));
    let events = drain_events(&mut rx);
    assert!(!events.iter().any(|event| matches!(
        event,
        WorkerEvent::Stalled { .. } | WorkerEvent::LockExtensionFailed { .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn hung_job_is_failed_and_never_redelivered() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_secs(40), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    h.queue.set_renewals_failing(true);
    let mut rx = h.worker.events().subscribe();
    let id = h.worker.submit(json!({ "projectId": "P4" })).await.unwrap();
    h.worker.start();

    wait_until("stall failure", || h.queue.state_of(&id) == Some(JobState::Failed)).await;
    // The handler is still running; it is not interrupted.
    assert_eq!(h.backup.running(), 1);

    wait_until("handler exit", || h.backup.running() == 0).await;
    h.worker.drain().await.unwrap();

    assert_eq!(h.queue.state_of(&id), Some(JobState::Failed));
    assert_eq!(h.queue.result_of(&id), None);
    assert_eq!(h.queue.claims_of(&id), 1);
    assert_eq!(h.backup.calls(), 1);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, WorkerEvent::LockExtensionFailed { job_id, .. } if job_id == &id)));
    assert!(events.iter().any(|e| matches!(e, WorkerEvent::Stalled { job_id } if job_id == &id)));
    assert!(events.iter().any(|e| matches!(e, WorkerEvent::Failed { retrying: false, .. })));
    assert!(!events.iter().any(|e| matches!(e, WorkerEvent::Completed { .. })));
}

#[tokio::test(start_paused = true)]
async fn at_most_capacity_jobs_run_at_once() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_secs(10), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    let mut ids = Vec::new();
    for n in 0..30 {
        ids.push(h.worker.submit(json!({ "projectId": format!("P{n}") })).await.unwrap());
    }
    h.worker.start();

    let worker = h.worker.clone();
    let queue = h.queue.clone();
    wait_until("all completed", || {
        assert!(worker.active_jobs() <= 15);
        assert!(queue.active_count() <= 15);
        ids.iter().all(|id| queue.state_of(id) == Some(JobState::Completed))
    })
    .await;
    h.worker.drain().await.unwrap();

    assert_eq!(h.backup.peak.load(Ordering::SeqCst), 15);
    assert_eq!(h.backup.calls(), 30);
}

#[tokio::test(start_paused = true)]
async fn drain_finishes_in_flight_work_before_closing() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_secs(10), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    let first = h.worker.submit(json!({ "projectId": "P5" })).await.unwrap();
    h.worker.start();
    wait_until("first job running", || h.backup.running() == 1).await;

    let drain = tokio::spawn({
        let worker = h.worker.clone();
        async move { worker.drain().await }
    });
    wait_until("admission stopped", || h.worker.is_paused()).await;
    let second = h.queue.enqueue(json!({ "projectId": "P6" })).await.unwrap();

    drain.await.unwrap().unwrap();

    assert_eq!(h.queue.state_of(&first), Some(JobState::Completed));
    assert_eq!(h.queue.state_of(&second), Some(JobState::Waiting));
    assert_eq!(h.backup.calls(), 1);
    assert!(h.queue.is_closed());
    assert_eq!(h.queue.active_at_close(), Some(0));
    assert_eq!(h.worker.active_jobs(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_drain_waits_for_the_same_shutdown() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_secs(3), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    let id = h.worker.submit(json!({ "projectId": "P7" })).await.unwrap();
    h.worker.start();
    wait_until("job running", || h.backup.running() == 1).await;

    let (a, b) = tokio::join!(h.worker.drain(), h.worker.drain());
    a.unwrap();
    b.unwrap();
    h.worker.drain().await.unwrap();

    assert_eq!(h.queue.state_of(&id), Some(JobState::Completed));
    assert_eq!(h.queue.active_at_close(), Some(0));
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_bounds_the_wait() {
    let config = WorkerConfig {
        drain_timeout: Some(Duration::from_secs(5)),
        ..test_config()
    };
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_secs(60), BackupSummary { errors: 0, completed: 1 }),
        config,
    );
    h.worker.submit(json!({ "projectId": "P8" })).await.unwrap();
    h.worker.start();
    wait_until("job running", || h.backup.running() == 1).await;

    h.worker.drain().await.unwrap();
    assert!(h.queue.is_closed());
    assert_eq!(h.queue.active_at_close(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn paused_worker_admits_nothing_until_resumed() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::from_millis(10), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    let mut rx = h.worker.events().subscribe();
    h.worker.start();
    assert!(h.worker.pause());
    assert!(!h.worker.pause());

    let id = h.worker.submit(json!({ "projectId": "P9" })).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.queue.state_of(&id), Some(JobState::Waiting));
    assert_eq!(h.backup.calls(), 0);

    assert!(h.worker.resume());
    wait_until("completion", || h.queue.state_of(&id) == Some(JobState::Completed)).await;
    h.worker.drain().await.unwrap();

    let names: Vec<&str> = drain_events(&mut rx).iter().map(WorkerEvent::name).collect();
    let paused = names.iter().position(|n| *n == "paused").unwrap();
    let resumed = names.iter().position(|n| *n == "resumed").unwrap();
    let active = names.iter().position(|n| *n == "active").unwrap();
    assert!(paused < resumed && resumed < active, "{names:?}");
}

#[tokio::test(start_paused = true)]
async fn duplicate_claim_is_rejected_by_the_queue() {
    let queue = MemoryQueue::default();
    queue.push_with_id("dup", json!({ "projectId": "P10" }));
    queue.push_with_id("dup", json!({ "projectId": "P10" }));
    let h = harness(
        queue,
        FakeBackup::new(Duration::from_secs(5), BackupSummary { errors: 0, completed: 1 }),
        test_config(),
    );
    let mut rx = h.worker.events().subscribe();
    h.worker.start();

    wait_until("completion", || h.queue.state_of("dup") == Some(JobState::Completed)).await;
    h.worker.drain().await.unwrap();

    assert_eq!(h.backup.calls(), 1);
    assert_eq!(h.backup.peak.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.claims_of("dup"), 1);
    assert!(drain_events(&mut rx).iter().any(|e| matches!(
        e,
        WorkerEvent::Error { error } if error.contains("already leased")
    )));
}

#[tokio::test(start_paused = true)]
async fn handler_failure_follows_queue_retry_policy() {
    let policy = QueuePolicy {
        max_attempts: 2,
        backoff: Duration::from_secs(5),
        ..QueuePolicy::default()
    };
    let h = harness(
        MemoryQueue::new(policy),
        FakeBackup::failing(Duration::from_millis(10)),
        test_config(),
    );
    let mut rx = h.worker.events().subscribe();
    let id = h.worker.submit(json!({ "projectId": "P11" })).await.unwrap();
    h.worker.start();

    wait_until("second attempt", || h.backup.calls() == 2).await;
    wait_until("terminal failure", || h.queue.state_of(&id) == Some(JobState::Failed)).await;
    h.worker.drain().await.unwrap();

    let error = h.queue.error_of(&id).unwrap();
    assert!(error.contains("P11"), "{error}");
    assert_eq!(h.worker.metrics().jobs(STATUS_FAILED), 2);

    let retrying: Vec<bool> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            WorkerEvent::Failed { retrying, .. } => Some(retrying),
            _ => None,
        })
        .collect();
    assert_eq!(retrying, vec![true, false]);
}

#[tokio::test]
async fn health_check_publishes_queue_depth() {
    let h = harness(
        MemoryQueue::default(),
        FakeBackup::new(Duration::ZERO, BackupSummary::default()),
        test_config(),
    );
    for n in 0..3 {
        h.worker.submit(json!({ "projectId": format!("P{n}") })).await.unwrap();
    }

    assert_eq!(h.worker.health_check().await.unwrap(), 3);
    assert_eq!(h.worker.metrics().queue_depth(), 3);

    h.worker.drain().await.unwrap();
    assert!(h.worker.health_check().await.is_err());
}

#[test]
fn worker_rejects_renewal_not_shorter_than_lease() {
    let config = WorkerConfig {
        renewal_interval: Duration::from_secs(15),
        ..test_config()
    };
    let queue = Arc::new(MemoryQueue::default());
    let metrics = Arc::new(WorkerMetrics::new().unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        FakeBackup::new(Duration::ZERO, BackupSummary::default()),
        Arc::new(FakeInitializer::default()),
        metrics.clone(),
    ));
    let result = Worker::new(queue, dispatcher, metrics, config);
    assert!(matches!(
        result,
        Err(ConfigError::RenewalNotShorterThanLease { .. })
    ));
}
