// src/queue/redis_queue.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nanoid::nanoid;
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::QueuePolicy;
use crate::error::QueueError;
use crate::job::{Job, JobFailure};
use crate::queue::{FailDisposition, JobQueue, StalledJob};
use crate::utils::constants::{
    PROMOTE_BATCH_LIMIT,
    STALLED_ERROR,
    SUFFIX_ACTIVE,
    SUFFIX_COMPLETED,
    SUFFIX_DELAYED,
    SUFFIX_FAILED,
    SUFFIX_JOB,
    SUFFIX_WAIT,
};
use crate::utils::rdconfig::get_redis_connection;

// Promote due retries, then pop the next waiting job under a new lease.
// An id that still holds a lease comes back with zero attempts. Ids that are
// no longer waiting are dropped from the list.
const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now, 'LIMIT', 0, tonumber(ARGV[5]))
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('RPUSH', KEYS[1], id)
  redis.call('HSET', ARGV[4] .. id, 'status', 'waiting')
end
local id, key
while true do
  id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  if redis.call('ZSCORE', KEYS[2], id) then
    return {id, '', 0}
  end
  key = ARGV[4] .. id
  if redis.call('HGET', key, 'status') == 'waiting' then
    break
  end
end
local expiry = now + tonumber(ARGV[2])
redis.call('ZADD', KEYS[2], expiry, id)
local attempts = redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'status', 'active', 'token', ARGV[3], 'lease_expires', expiry, 'processed_at', now)
local payload = redis.call('HGET', key, 'payload')
if not payload then
  payload = ''
end
return {id, payload, attempts}
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', ARGV[5], 'token') ~= ARGV[2] then
  return 0
end
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
local expiry = tonumber(ARGV[3]) + tonumber(ARGV[4])
redis.call('ZADD', KEYS[1], expiry, ARGV[1])
redis.call('HSET', ARGV[5], 'lease_expires', expiry)
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', ARGV[5], 'token') ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', ARGV[5], 'token', 'lease_expires')
redis.call('HSET', ARGV[5], 'status', 'completed', 'result', ARGV[3], 'finished_at', ARGV[4])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

// Returns 0 when the lease is gone, 1 when failed, 2 when scheduled for retry.
const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', ARGV[7], 'token') ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', ARGV[7], 'token', 'lease_expires')
redis.call('HSET', ARGV[7], 'error', ARGV[3])
if ARGV[5] == '1' then
  redis.call('HSET', ARGV[7], 'status', 'delayed', 'run_at', ARGV[6])
  redis.call('ZADD', KEYS[3], tonumber(ARGV[6]), ARGV[1])
  return 2
end
redis.call('HSET', ARGV[7], 'status', 'failed', 'failed_at', ARGV[4])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

const REAP_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local out = {}
for _, id in ipairs(expired) do
  local key = ARGV[3] .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', key, 'token', 'lease_expires')
  local stalled = redis.call('HINCRBY', key, 'stalled', 1)
  if stalled > tonumber(ARGV[2]) then
    redis.call('HSET', key, 'status', 'failed', 'error', ARGV[5], 'failed_at', ARGV[4])
    redis.call('RPUSH', KEYS[2], id)
    table.insert(out, id)
    table.insert(out, 'failed')
  else
    redis.call('HSET', key, 'status', 'waiting')
    redis.call('RPUSH', KEYS[3], id)
    table.insert(out, id)
    table.insert(out, 'requeued')
  end
end
return out
"#;

/// Key layout for one named queue: `{prefix}:{queue}:{suffix}`.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    pub wait: String,
    pub active: String,
    pub delayed: String,
    pub completed: String,
    pub failed: String,
    pub job_prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            wait: format!("{base}:{SUFFIX_WAIT}"),
            active: format!("{base}:{SUFFIX_ACTIVE}"),
            delayed: format!("{base}:{SUFFIX_DELAYED}"),
            completed: format!("{base}:{SUFFIX_COMPLETED}"),
            failed: format!("{base}:{SUFFIX_FAILED}"),
            job_prefix: format!("{base}:{SUFFIX_JOB}:"),
        }
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix, job_id)
    }
}

pub struct RedisQueue {
    conn: MultiplexedConnection,
    policy: QueuePolicy,
    keys: QueueKeys,
    closed: AtomicBool,
    claim: Script,
    renew: Script,
    complete: Script,
    fail: Script,
    reap: Script,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, policy: QueuePolicy) -> Result<Self, QueueError> {
        let conn = get_redis_connection(redis_url).await?;
        Ok(Self::with_connection(conn, policy))
    }

    pub fn with_connection(conn: MultiplexedConnection, policy: QueuePolicy) -> Self {
        let keys = QueueKeys::new(&policy.prefix, &policy.queue);
        Self {
            conn,
            policy,
            keys,
            closed: AtomicBool::new(false),
            claim: Script::new(CLAIM_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            reap: Script::new(REAP_SCRIPT),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(self.conn.clone())
    }

    fn lease_lost(job: &Job) -> QueueError {
        QueueError::LeaseLost {
            job_id: job.id.clone(),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, payload: Value) -> Result<String, QueueError> {
        let mut conn = self.conn()?;
        let payload = serde_json::to_string(&payload)?;
        let job_id = nanoid!(10);
        let job_key = self.keys.job(&job_id);
        let now = Utc::now().to_rfc3339();

        redis::pipe()
            .atomic()
            .hset_multiple(&job_key, &[
                ("status", "waiting"),
                ("payload", payload.as_str()),
                ("created_at", now.as_str()),
                ("attempts", "0"),
                ("stalled", "0"),
            ])
            .ignore()
            .rpush(&self.keys.wait, &job_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(target: "queue", job_id = %job_id, queue = %self.policy.queue, "✅ enqueued job");
        Ok(job_id)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn()?;
        let token = nanoid!(16);

        let claimed: Option<(String, String, u32)> = self
            .claim
            .key(&self.keys.wait)
            .key(&self.keys.active)
            .key(&self.keys.delayed)
            .arg(now_millis())
            .arg(lease.as_millis() as u64)
            .arg(&token)
            .arg(&self.keys.job_prefix)
            .arg(PROMOTE_BATCH_LIMIT)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, raw, attempts)) = claimed else {
            return Ok(None);
        };
        if attempts == 0 {
            return Err(QueueError::AlreadyLeased { job_id: id });
        }

        // Unparseable payloads still get claimed so the dispatcher can fail them.
        let payload = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        Ok(Some(Job {
            id,
            payload,
            token,
            attempts,
        }))
    }

    async fn renew_lease(&self, job: &Job, lease: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let renewed: i64 = self
            .renew
            .key(&self.keys.active)
            .arg(&job.id)
            .arg(&job.token)
            .arg(now_millis())
            .arg(lease.as_millis() as u64)
            .arg(self.keys.job(&job.id))
            .invoke_async(&mut conn)
            .await?;

        if renewed == 1 {
            debug!(target: "queue", job_id = %job.id, "lease renewed");
            Ok(())
        } else {
            Err(Self::lease_lost(job))
        }
    }

    async fn mark_completed(&self, job: &Job, result: &str) -> Result<(), QueueError> {
        let mut conn = self.conn()?;
        let done: i64 = self
            .complete
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .arg(&job.id)
            .arg(&job.token)
            .arg(result)
            .arg(Utc::now().to_rfc3339())
            .arg(self.keys.job(&job.id))
            .invoke_async(&mut conn)
            .await?;

        if done == 1 {
            Ok(())
        } else {
            Err(Self::lease_lost(job))
        }
    }

    async fn mark_failed(
        &self,
        job: &Job,
        failure: &JobFailure,
    ) -> Result<FailDisposition, QueueError> {
        let mut conn = self.conn()?;
        let retry = failure.retryable && self.policy.should_retry(job.attempts);
        let delay = self.policy.backoff_for(job.attempts);
        let run_at = now_millis() + delay.as_millis() as i64;

        let outcome: i64 = self
            .fail
            .key(&self.keys.active)
            .key(&self.keys.failed)
            .key(&self.keys.delayed)
            .arg(&job.id)
            .arg(&job.token)
            .arg(&failure.message)
            .arg(Utc::now().to_rfc3339())
            .arg(if retry { "1" } else { "0" })
            .arg(run_at)
            .arg(self.keys.job(&job.id))
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            2 => Ok(FailDisposition::Retrying { delay }),
            1 => Ok(FailDisposition::Failed),
            _ => Err(Self::lease_lost(job)),
        }
    }

    async fn reap_stalled(&self, max_stalled: u32) -> Result<Vec<StalledJob>, QueueError> {
        let mut conn = self.conn()?;
        let flat: Vec<String> = self
            .reap
            .key(&self.keys.active)
            .key(&self.keys.failed)
            .key(&self.keys.wait)
            .arg(now_millis())
            .arg(max_stalled)
            .arg(&self.keys.job_prefix)
            .arg(Utc::now().to_rfc3339())
            .arg(STALLED_ERROR)
            .invoke_async(&mut conn)
            .await?;

        Ok(flat
            .chunks(2)
            .filter_map(|pair| match pair {
                [job_id, outcome] => Some(StalledJob {
                    job_id: job_id.clone(),
                    failed: outcome == "failed",
                }),
                _ => None,
            })
            .collect())
    }

    async fn count(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn()?;
        let (waiting, delayed): (u64, u64) = redis::pipe()
            .llen(&self.keys.wait)
            .zcard(&self.keys.delayed)
            .query_async(&mut conn)
            .await?;
        Ok(waiting + delayed)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(target: "queue", queue = %self.policy.queue, "queue connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_queue() {
        let keys = QueueKeys::new("backup", "nightly");
        assert_eq!(keys.wait, "backup:nightly:wait");
        assert_eq!(keys.active, "backup:nightly:active");
        assert_eq!(keys.delayed, "backup:nightly:delayed");
        assert_eq!(keys.job("abc"), "backup:nightly:job:abc");
    }
}
