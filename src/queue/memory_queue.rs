// src/queue/memory_queue.rs
//
// In-process queue with the same lease semantics as the Redis store. Time is
// tokio's clock, so paused-time tests drive lease expiry deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nanoid::nanoid;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::QueuePolicy;
use crate::error::QueueError;
use crate::job::{Job, JobFailure, JobState};
use crate::queue::{FailDisposition, JobQueue, StalledJob};
use crate::utils::constants::STALLED_ERROR;

#[derive(Debug)]
struct Entry {
    payload: Value,
    state: JobState,
    attempts: u32,
    stalled: u32,
    token: Option<String>,
    lease_expires: Option<Instant>,
    run_at: Option<Instant>,
    result: Option<String>,
    error: Option<String>,
    claims: u32,
    renewals: u32,
}

impl Entry {
    fn waiting(payload: Value) -> Self {
        Self {
            payload,
            state: JobState::Waiting,
            attempts: 0,
            stalled: 0,
            token: None,
            lease_expires: None,
            run_at: None,
            result: None,
            error: None,
            claims: 0,
            renewals: 0,
        }
    }

    fn holds(&self, job: &Job) -> bool {
        self.state == JobState::Active && self.token.as_deref() == Some(job.token.as_str())
    }

    fn release_lease(&mut self) {
        self.token = None;
        self.lease_expires = None;
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, Entry>,
    wait: VecDeque<String>,
    closed: bool,
    fail_renewals: bool,
    active_at_close: Option<usize>,
}

impl State {
    fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|entry| entry.state == JobState::Active)
            .count()
    }

    fn promote_delayed(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = self
            .jobs
            .iter()
            .filter_map(|(id, entry)| match (entry.state, entry.run_at) {
                (JobState::Delayed, Some(at)) if at <= now => Some((at, id.clone())),
                _ => None,
            })
            .collect();
        due.sort();

        for (_, id) in due {
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.state = JobState::Waiting;
                entry.run_at = None;
            }
            self.wait.push_back(id);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    policy: QueuePolicy,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        let state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        Ok(state)
    }

    /// Queue a job under a caller-chosen id. Pushing an id that is already
    /// known only appends it to the wait list again.
    pub fn push_with_id(&self, job_id: impl Into<String>, payload: Value) {
        let job_id = job_id.into();
        let mut state = self.lock();
        state
            .jobs
            .entry(job_id.clone())
            .or_insert_with(|| Entry::waiting(payload));
        state.wait.push_back(job_id);
    }

    /// Make every renewal fail as if storage were unreachable.
    pub fn set_renewals_failing(&self, failing: bool) {
        self.lock().fail_renewals = failing;
    }

    pub fn state_of(&self, job_id: &str) -> Option<JobState> {
        self.lock().jobs.get(job_id).map(|entry| entry.state)
    }

    pub fn result_of(&self, job_id: &str) -> Option<String> {
        self.lock().jobs.get(job_id).and_then(|entry| entry.result.clone())
    }

    pub fn error_of(&self, job_id: &str) -> Option<String> {
        self.lock().jobs.get(job_id).and_then(|entry| entry.error.clone())
    }

    /// Times the job was handed out by `claim_next`.
    pub fn claims_of(&self, job_id: &str) -> u32 {
        self.lock().jobs.get(job_id).map_or(0, |entry| entry.claims)
    }

    pub fn renewals_of(&self, job_id: &str) -> u32 {
        self.lock().jobs.get(job_id).map_or(0, |entry| entry.renewals)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Active jobs at the moment `close` was first called.
    pub fn active_at_close(&self) -> Option<usize> {
        self.lock().active_at_close
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, payload: Value) -> Result<String, QueueError> {
        let mut state = self.open()?;
        let job_id = nanoid!(10);
        state.jobs.insert(job_id.clone(), Entry::waiting(payload));
        state.wait.push_back(job_id.clone());
        Ok(job_id)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, QueueError> {
        let mut state = self.open()?;
        let now = Instant::now();
        state.promote_delayed(now);

        // Ids that already finished are dropped from the wait list unclaimed.
        let job_id = loop {
            let Some(job_id) = state.wait.pop_front() else {
                return Ok(None);
            };
            match state.jobs.get(&job_id).map(|entry| entry.state) {
                Some(JobState::Waiting) => break job_id,
                Some(JobState::Active) => return Err(QueueError::AlreadyLeased { job_id }),
                _ => continue,
            }
        };
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let token = nanoid!(16);
        entry.state = JobState::Active;
        entry.attempts += 1;
        entry.claims += 1;
        entry.token = Some(token.clone());
        entry.lease_expires = Some(now + lease);

        Ok(Some(Job {
            id: job_id,
            payload: entry.payload.clone(),
            token,
            attempts: entry.attempts,
        }))
    }

    async fn renew_lease(&self, job: &Job, lease: Duration) -> Result<(), QueueError> {
        let mut state = self.open()?;
        if state.fail_renewals {
            return Err(QueueError::Unavailable("renewal rejected".into()));
        }
        match state.jobs.get_mut(&job.id) {
            Some(entry) if entry.holds(job) => {
                entry.lease_expires = Some(Instant::now() + lease);
                entry.renewals += 1;
                Ok(())
            }
            _ => Err(QueueError::LeaseLost {
                job_id: job.id.clone(),
            }),
        }
    }

    async fn mark_completed(&self, job: &Job, result: &str) -> Result<(), QueueError> {
        let mut state = self.open()?;
        match state.jobs.get_mut(&job.id) {
            Some(entry) if entry.holds(job) => {
                entry.state = JobState::Completed;
                entry.result = Some(result.to_string());
                entry.release_lease();
                Ok(())
            }
            _ => Err(QueueError::LeaseLost {
                job_id: job.id.clone(),
            }),
        }
    }

    async fn mark_failed(
        &self,
        job: &Job,
        failure: &JobFailure,
    ) -> Result<FailDisposition, QueueError> {
        let mut state = self.open()?;
        let entry = match state.jobs.get_mut(&job.id) {
            Some(entry) if entry.holds(job) => entry,
            _ => {
                return Err(QueueError::LeaseLost {
                    job_id: job.id.clone(),
                })
            }
        };

        entry.release_lease();
        entry.error = Some(failure.message.clone());
        if failure.retryable && self.policy.should_retry(entry.attempts) {
            let delay = self.policy.backoff_for(entry.attempts);
            entry.state = JobState::Delayed;
            entry.run_at = Some(Instant::now() + delay);
            Ok(FailDisposition::Retrying { delay })
        } else {
            entry.state = JobState::Failed;
            Ok(FailDisposition::Failed)
        }
    }

    async fn reap_stalled(&self, max_stalled: u32) -> Result<Vec<StalledJob>, QueueError> {
        let mut state = self.open()?;
        let now = Instant::now();

        let mut expired: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, entry)| {
                entry.state == JobState::Active
                    && entry.lease_expires.is_some_and(|at| at < now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        let mut reaped = Vec::with_capacity(expired.len());
        for job_id in expired {
            let Some(entry) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            entry.release_lease();
            entry.stalled += 1;
            let failed = entry.stalled > max_stalled;
            if failed {
                entry.state = JobState::Failed;
                entry.error = Some(STALLED_ERROR.to_string());
            } else {
                entry.state = JobState::Waiting;
                state.wait.push_back(job_id.clone());
            }
            reaped.push(StalledJob { job_id, failed });
        }
        Ok(reaped)
    }

    async fn count(&self) -> Result<u64, QueueError> {
        let state = self.open()?;
        let delayed = state
            .jobs
            .values()
            .filter(|entry| entry.state == JobState::Delayed)
            .count();
        Ok((state.wait.len() + delayed) as u64)
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.active_at_close = Some(state.active_count());
        }
        Ok(())
    }
}
