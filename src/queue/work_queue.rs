//! Redis-backed work queues.
//!
//! Each queue keeps a priority-ordered waiting set, a delayed set promoted
//! by timestamp, and a per-job hash with payload, attempt count, progress
//! and last error. Delivery is at-least-once: handlers must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Failed job hashes are kept around for a day for inspection.
const FAILED_JOB_RETENTION_SECS: i64 = 86_400;
/// Idle poll interval when the queue is empty.
const POLL_INTERVAL_MS: u64 = 1_000;
/// How many due delayed jobs to promote per poll.
const PROMOTE_BATCH: isize = 16;

/// A job leased to a worker. `attempts` includes the current one.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: String,
    pub payload: String,
    pub attempts: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-scheduled with backoff; contains the delay in milliseconds.
    Retrying(u64),
    /// Attempts exhausted or error deterministic; job is terminal.
    Exhausted,
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &ActiveJob, queue: &WorkQueue) -> Result<()>;
}

#[derive(Clone)]
pub struct WorkQueue {
    name: String,
    redis: ConnectionManager,
    max_attempts: u32,
    backoff_base_ms: u64,
    job_timeout_ms: u64,
}

impl WorkQueue {
    pub fn new(
        name: impl Into<String>,
        redis: ConnectionManager,
        max_attempts: u32,
        backoff_base_ms: u64,
        job_timeout_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            redis,
            max_attempts,
            backoff_base_ms,
            job_timeout_ms,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn waiting_key(&self) -> String {
        format!("{}:waiting", self.name)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.name)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.name, id)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.name)
    }

    fn counter_key(&self, which: &str) -> String {
        format!("{}:{}", self.name, which)
    }

    /// Enqueue a job. Returns false when a job with the same id already
    /// exists (dedup for at-least-once producers).
    pub async fn enqueue(
        &self,
        id: &str,
        payload: &str,
        priority: u8,
        delay_ms: u64,
    ) -> Result<bool> {
        let mut conn = self.redis.clone();
        let job_key = self.job_key(id);

        let exists: bool = conn.exists(&job_key).await?;
        if exists {
            debug!(queue = %self.name, job_id = %id, "Duplicate job id, skipping enqueue");
            return Ok(false);
        }

        let now = Utc::now().timestamp_millis();
        conn.hset_multiple::<_, _, _, ()>(
            &job_key,
            &[
                ("payload", payload.to_string()),
                ("priority", priority.to_string()),
                ("attempts", "0".to_string()),
                ("progress", "0".to_string()),
                (
                    "state",
                    (if delay_ms > 0 { "delayed" } else { "waiting" }).to_string(),
                ),
                ("enqueued_at", now.to_string()),
            ],
        )
        .await?;

        if delay_ms > 0 {
            let ready_at = now + delay_ms as i64;
            conn.zadd::<_, _, _, ()>(self.delayed_key(), id, ready_at as f64).await?;
        } else {
            let seq: u64 = conn.incr(self.seq_key(), 1).await?;
            conn.zadd::<_, _, _, ()>(self.waiting_key(), id, priority_score(priority, seq))
                .await?;
        }

        debug!(queue = %self.name, job_id = %id, priority, delay_ms, "Enqueued job");
        Ok(true)
    }

    /// Move due delayed jobs into the waiting set.
    async fn promote_due(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis() as f64;
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.delayed_key(), "-inf", now, 0, PROMOTE_BATCH)
            .await?;

        for id in due {
            // Only the worker that wins the ZREM moves the job.
            let removed: i64 = conn.zrem(self.delayed_key(), &id).await?;
            if removed == 0 {
                continue;
            }
            let priority: u8 = conn
                .hget::<_, _, Option<String>>(self.job_key(&id), "priority")
                .await?
                .and_then(|p| p.parse().ok())
                .unwrap_or(5);
            let seq: u64 = conn.incr(self.seq_key(), 1).await?;
            conn.zadd::<_, _, _, ()>(self.waiting_key(), &id, priority_score(priority, seq))
                .await?;
            conn.hset::<_, _, _, ()>(self.job_key(&id), "state", "waiting").await?;
        }
        Ok(())
    }

    /// Lease the highest-priority ready job, if any.
    pub async fn pop(&self) -> Result<Option<ActiveJob>> {
        self.promote_due().await?;

        let mut conn = self.redis.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(self.waiting_key(), 1).await?;
        let Some((id, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let job_key = self.job_key(&id);
        let payload: Option<String> = conn.hget(&job_key, "payload").await?;
        let Some(payload) = payload else {
            // Hash vanished underneath us (manual cleanup or expiry).
            warn!(queue = %self.name, job_id = %id, "Popped job without a payload hash");
            return Ok(None);
        };

        let attempts: u32 = conn.hincr::<_, _, _, i64>(&job_key, "attempts", 1).await? as u32;
        conn.hset_multiple::<_, _, _, ()>(
            &job_key,
            &[
                ("state", "active".to_string()),
                ("started_at", Utc::now().timestamp_millis().to_string()),
            ],
        )
        .await?;

        Ok(Some(ActiveJob {
            id,
            payload,
            attempts,
        }))
    }

    pub async fn complete(&self, id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.job_key(id)).await?;
        conn.incr::<_, _, ()>(self.counter_key("completed"), 1).await?;
        Ok(())
    }

    /// Record a failure, scheduling a retry with exponential backoff while
    /// attempts remain and the error is retriable.
    pub async fn fail(
        &self,
        job: &ActiveJob,
        error: &str,
        retriable: bool,
    ) -> Result<FailureDisposition> {
        let mut conn = self.redis.clone();
        let job_key = self.job_key(&job.id);
        conn.hset::<_, _, _, ()>(&job_key, "error", error).await?;

        if retriable && job.attempts < self.max_attempts {
            let delay = backoff_ms(self.backoff_base_ms, job.attempts);
            let ready_at = Utc::now().timestamp_millis() + delay as i64;
            conn.zadd::<_, _, _, ()>(self.delayed_key(), &job.id, ready_at as f64).await?;
            conn.hset::<_, _, _, ()>(&job_key, "state", "delayed").await?;
            info!(
                queue = %self.name,
                job_id = %job.id,
                attempt = job.attempts,
                delay_ms = delay,
                "Job failed, retry scheduled"
            );
            return Ok(FailureDisposition::Retrying(delay));
        }

        conn.hset::<_, _, _, ()>(&job_key, "state", "failed").await?;
        conn.expire::<_, ()>(&job_key, FAILED_JOB_RETENTION_SECS).await?;
        conn.incr::<_, _, ()>(self.counter_key("failed"), 1).await?;
        warn!(queue = %self.name, job_id = %job.id, attempts = job.attempts, "Job failed terminally: {}", error);
        Ok(FailureDisposition::Exhausted)
    }

    /// Put a leased job back at the front of its priority class without
    /// burning an attempt. Used when shutdown interrupts processing.
    pub async fn requeue(&self, job: &ActiveJob) -> Result<()> {
        let mut conn = self.redis.clone();
        let job_key = self.job_key(&job.id);
        conn.hincr::<_, _, _, i64>(&job_key, "attempts", -1).await?;
        let priority: u8 = conn
            .hget::<_, _, Option<String>>(&job_key, "priority")
            .await?
            .and_then(|p| p.parse().ok())
            .unwrap_or(5);
        conn.zadd::<_, _, _, ()>(self.waiting_key(), &job.id, priority_score(priority, 0))
            .await?;
        conn.hset::<_, _, _, ()>(&job_key, "state", "waiting").await?;
        Ok(())
    }

    pub async fn set_progress(&self, id: &str, progress: u8) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(self.job_key(id), "progress", progress.min(100))
            .await?;
        Ok(())
    }

    /// Run `concurrency` consumer loops until shutdown flips. Each loop
    /// leases one job at a time; handler time is bounded by the job timeout
    /// and a timed-out or interrupted job goes back through the retry path.
    pub async fn run(
        self,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
        shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = Vec::with_capacity(concurrency);
        for worker_idx in 0..concurrency {
            let queue = self.clone();
            let handler = handler.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                info!(queue = %queue.name, worker = worker_idx, "Work-queue consumer started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match queue.pop().await {
                        Ok(Some(job)) => {
                            queue.process_one(&job, handler.as_ref(), &mut shutdown).await;
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(tokio::time::Duration::from_millis(POLL_INTERVAL_MS)) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(e) => {
                            error!(queue = %queue.name, "Work-queue poll failed: {}", e);
                            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                info!(queue = %queue.name, worker = worker_idx, "Work-queue consumer stopped");
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn process_one(
        &self,
        job: &ActiveJob,
        handler: &dyn JobHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let timeout = tokio::time::Duration::from_millis(self.job_timeout_ms);
        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, handler.handle(job, self)) => Some(res),
            _ = shutdown.changed() => None,
        };

        let result = match outcome {
            // Shutdown raced the handler: the in-flight future (and any
            // encoder subprocess spawned with kill_on_drop) is dropped and
            // the job goes back to the waiting set.
            None => {
                if let Err(e) = self.requeue(job).await {
                    error!(queue = %self.name, job_id = %job.id, "Requeue on shutdown failed: {}", e);
                }
                return;
            }
            Some(Ok(Ok(()))) => self.complete(&job.id).await.map(|_| ()),
            Some(Ok(Err(e))) => self
                .fail(job, &e.to_string(), e.is_retriable())
                .await
                .map(|_| ()),
            Some(Err(_elapsed)) => self
                .fail(job, &format!("job timed out after {}ms", self.job_timeout_ms), true)
                .await
                .map(|_| ()),
        };

        if let Err(e) = result {
            error!(queue = %self.name, job_id = %job.id, "Failed to settle job: {}", e);
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`.
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    base.saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
}

/// Waiting-set score: priority class dominates, FIFO within a class.
/// Lower scores pop first; priority 10 is the most urgent.
fn priority_score(priority: u8, seq: u64) -> f64 {
    (10 - priority.min(10)) as f64 * 1e12 + seq as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_ms(30_000, 1), 30_000);
        assert_eq!(backoff_ms(30_000, 2), 60_000);
        assert_eq!(backoff_ms(30_000, 3), 120_000);
    }

    #[test]
    fn backoff_is_capped_against_overflow() {
        // Attempt counts far beyond the cap still produce a finite delay.
        assert_eq!(backoff_ms(30_000, 64), 30_000 * (1 << 20));
    }

    #[test]
    fn higher_priority_pops_first() {
        assert!(priority_score(10, 100) < priority_score(5, 1));
        assert!(priority_score(5, 100) < priority_score(1, 1));
    }

    #[test]
    fn fifo_within_a_priority_class() {
        assert!(priority_score(5, 1) < priority_score(5, 2));
    }
}
