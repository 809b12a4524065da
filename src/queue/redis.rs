//! Redis-based queue backend with reliable dequeue.
//!
//! Each logical queue uses a handful of Redis keys:
//!
//! - `{name}`: waiting jobs (LPUSH on enqueue, oldest at the right end)
//! - `{name}:processing`: jobs currently held by a worker
//! - `{name}:dead_letter`: jobs that failed after exhausting attempts
//! - `{name}:completed` / `{name}:failed`: cumulative counters
//!
//! Dequeue uses `BRPOPLPUSH` to atomically move a job into the processing
//! list, so a worker crash never loses a job: [`recover_stalled`]
//! re-queues anything left behind.
//!
//! [`recover_stalled`]: RedisJobQueue::recover_stalled

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{error, warn};
use uuid::Uuid;

use crate::job::Job;

use super::{JobCounts, JobState, QueueBackend, QueueError};

/// Redis-backed job queue shared by producers and the worker pool.
#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    name: String,
    processing_key: String,
    dead_letter_key: String,
    completed_key: String,
    failed_key: String,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RedisJobQueue {
    /// Connects to Redis and binds to the named queue.
    pub async fn connect(redis_url: &str, name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, name))
    }

    /// Binds to the named queue on an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, name: &str) -> Self {
        Self {
            redis,
            name: name.to_string(),
            processing_key: format!("{name}:processing"),
            dead_letter_key: format!("{name}:dead_letter"),
            completed_key: format!("{name}:completed"),
            failed_key: format!("{name}:failed"),
        }
    }

    /// Enqueues multiple jobs in one pipelined round trip.
    pub async fn enqueue_batch(&self, jobs: Vec<Job>) -> Result<(), QueueError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let serialized: Result<Vec<String>, _> = jobs.iter().map(serde_json::to_string).collect();
        let serialized = serialized?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for job_data in &serialized {
            pipe.lpush(&self.name, job_data);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Deletes all queue keys. Intended for tests and operational resets.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(&self.name)
            .del(&self.processing_key)
            .del(&self.dead_letter_key)
            .del(&self.completed_key)
            .del(&self.failed_key);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Removes a job from the processing list by id.
    ///
    /// A missing job is not an error: it may already have been removed by
    /// stalled-job recovery.
    async fn remove_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;

        for entry in entries {
            if let Ok(job) = serde_json::from_str::<Job>(&entry) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&self.processing_key, 1, &entry).await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn push_dead_letter(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;

        let mut pipe = redis::pipe();
        pipe.lpush(&self.dead_letter_key, serialized)
            .incr(&self.failed_key, 1u64);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Lists a page of a Redis list in oldest-first order.
    ///
    /// Lists are LPUSHed, so the oldest element sits at the right end;
    /// the negative range selects the page and the reverse restores
    /// oldest-first order.
    async fn page_oldest_first(
        &self,
        key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let start = -((offset + limit) as isize);
        let stop = -((offset + 1) as isize);
        let mut page: Vec<String> = conn.lrange(key, start, stop).await?;
        page.reverse();
        Ok(page)
    }
}

#[async_trait]
impl QueueBackend for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.name, serialized).await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let wait_secs = wait.as_secs().max(1) as usize;

        let entry: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.name)
            .arg(&self.processing_key)
            .arg(wait_secs)
            .query_async(&mut conn)
            .await?;

        match entry {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.remove_from_processing(job_id).await?;
        let mut conn = self.redis.clone();
        conn.incr::<_, _, ()>(&self.completed_key, 1u64).await?;
        Ok(())
    }

    async fn retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        self.remove_from_processing(job.id).await?;
        let serialized = serde_json::to_string(&job)?;

        let mut conn = self.redis.clone();
        let queue_key = self.name.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Front of the queue, so the retried job runs next.
            if let Err(e) = conn.rpush::<_, _, ()>(&queue_key, serialized).await {
                error!(job_id = %job_id, error = %e, "failed to re-queue job after backoff");
            }
        });
        Ok(())
    }

    async fn fail(&self, job: Job, error: &str) -> Result<(), QueueError> {
        self.remove_from_processing(job.id).await?;

        if job.should_retry() {
            let serialized = serde_json::to_string(&job)?;
            let mut conn = self.redis.clone();
            conn.rpush::<_, _, ()>(&self.name, serialized).await?;
        } else {
            self.push_dead_letter(&job, error).await?;
        }
        Ok(())
    }

    async fn job_counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.redis.clone();
        let (waiting, active, completed, failed): (usize, usize, Option<u64>, Option<u64>) =
            redis::pipe()
                .llen(&self.name)
                .llen(&self.processing_key)
                .get(&self.completed_key)
                .get(&self.failed_key)
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    async fn waiting_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.name).await?)
    }

    async fn active_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.processing_key).await?)
    }

    async fn jobs(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let key = match state {
            JobState::Waiting => &self.name,
            JobState::Active => &self.processing_key,
            JobState::DeadLetter => &self.dead_letter_key,
        };
        let page = self.page_oldest_first(key, offset, limit).await?;

        let mut jobs = Vec::with_capacity(page.len());
        for entry in page {
            let job = match state {
                JobState::DeadLetter => {
                    let wrapper: serde_json::Value = serde_json::from_str(&entry)?;
                    serde_json::from_value(wrapper.get("job").cloned().unwrap_or_default())
                }
                _ => serde_json::from_str(&entry),
            };
            match job {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(queue = %self.name, error = %e, "skipping unparseable job entry"),
            }
        }
        Ok(jobs)
    }

    async fn oldest_waiting(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut conn = self.redis.clone();
        let entry: Option<String> = conn.lindex(&self.name, -1).await?;
        match entry {
            Some(data) => {
                let job: Job = serde_json::from_str(&data)?;
                Ok(Some(job.enqueued_at))
            }
            None => Ok(None),
        }
    }

    async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        let mut recovered = 0;

        for entry in entries {
            let Ok(mut job) = serde_json::from_str::<Job>(&entry) else {
                warn!(queue = %self.name, "dropping unparseable entry from processing list");
                conn.lrem::<_, _, ()>(&self.processing_key, 1, &entry).await?;
                continue;
            };

            job.increment_attempts();
            recovered += 1;

            if job.should_retry() {
                let serialized = serde_json::to_string(&job)?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&self.processing_key, 1, &entry)
                    .rpush(&self.name, &serialized);
                pipe.query_async::<_, ()>(&mut conn).await?;
            } else {
                conn.lrem::<_, _, ()>(&self.processing_key, 1, &entry).await?;
                self.push_dead_letter(&job, "stalled past max attempts").await?;
            }
        }
        Ok(recovered)
    }
}
