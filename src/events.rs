// src/events.rs
use std::time::Duration;

use tokio::sync::broadcast;

use crate::utils::constants::EVENT_CHANNEL_CAPACITY;

/// Lifecycle transitions published by the worker.
///
/// Logging and metrics subscribe to these instead of being called from the
/// lease, stall and outcome paths directly.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Waiting { job_id: String },
    Active { job_id: String, attempts: u32 },
    Completed { job_id: String, result: String, duration: Duration },
    Failed { job_id: String, error: String, retrying: bool, duration: Option<Duration> },
    Stalled { job_id: String },
    LockExtensionFailed { job_id: String, error: String },
    Paused,
    Resumed,
    Error { error: String },
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Waiting { .. } => "waiting",
            WorkerEvent::Active { .. } => "active",
            WorkerEvent::Completed { .. } => "completed",
            WorkerEvent::Failed { .. } => "failed",
            WorkerEvent::Stalled { .. } => "stalled",
            WorkerEvent::LockExtensionFailed { .. } => "lock-extension-failed",
            WorkerEvent::Paused => "paused",
            WorkerEvent::Resumed => "resumed",
            WorkerEvent::Error { .. } => "error",
        }
    }
}

/// Cloneable publisher for [`WorkerEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    // No subscribers is fine; events are best effort.
    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(WorkerEvent::Paused);
        bus.emit(WorkerEvent::Resumed);
        assert_eq!(rx.recv().await.unwrap(), WorkerEvent::Paused);
        assert_eq!(rx.recv().await.unwrap().name(), "resumed");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.emit(WorkerEvent::Error { error: "boom".into() });
    }
}
