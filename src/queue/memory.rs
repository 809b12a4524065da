//! In-process queue backend for tests and single-node embedders.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::job::Job;

use super::{JobCounts, JobState, QueueBackend, QueueError};

#[derive(Debug, Default)]
struct MemoryState {
    waiting: VecDeque<Job>,
    active: HashMap<Uuid, Job>,
    dead_letter: Vec<(Job, String)>,
    completed: u64,
    failed: u64,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<MemoryState>,
    arrivals: Notify,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A `VecDeque`-backed queue with the same contract as the Redis backend.
#[derive(Debug, Clone)]
pub struct MemoryJobQueue {
    inner: Arc<Inner>,
}

impl MemoryJobQueue {
    /// Creates an empty queue with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(MemoryState::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Returns dead-lettered jobs with their final error, oldest first.
    pub fn dead_letter_entries(&self) -> Vec<(Job, String)> {
        self.inner.lock().dead_letter.clone()
    }

    fn try_pop(&self) -> Option<Job> {
        let mut state = self.inner.lock();
        let job = state.waiting.pop_front()?;
        state.active.insert(job.id, job.clone());
        Some(job)
    }
}

#[async_trait]
impl QueueBackend for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.inner.lock().waiting.push_back(job);
        self.inner.arrivals.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_pop() {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.inner.arrivals.notified() => {}
                _ = sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        if state.active.remove(&job_id).is_some() {
            state.completed += 1;
        }
        Ok(())
    }

    async fn retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.inner.lock();
            state.active.remove(&job.id);
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            sleep(delay).await;
            inner.lock().waiting.push_front(job);
            inner.arrivals.notify_one();
        });
        Ok(())
    }

    async fn fail(&self, job: Job, error: &str) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        state.active.remove(&job.id);
        if job.should_retry() {
            state.waiting.push_front(job);
            drop(state);
            self.inner.arrivals.notify_one();
        } else {
            state.dead_letter.push((job, error.to_string()));
            state.failed += 1;
        }
        Ok(())
    }

    async fn job_counts(&self) -> Result<JobCounts, QueueError> {
        let state = self.inner.lock();
        Ok(JobCounts {
            waiting: state.waiting.len(),
            active: state.active.len(),
            completed: state.completed,
            failed: state.failed,
        })
    }

    async fn waiting_count(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().waiting.len())
    }

    async fn active_count(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().active.len())
    }

    async fn jobs(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let guard = self.inner.lock();
        let jobs: Vec<Job> = match state {
            JobState::Waiting => guard.waiting.iter().cloned().collect(),
            JobState::Active => {
                let mut active: Vec<Job> = guard.active.values().cloned().collect();
                active.sort_by_key(|j| j.enqueued_at);
                active
            }
            JobState::DeadLetter => guard.dead_letter.iter().map(|(j, _)| j.clone()).collect(),
        };
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn oldest_waiting(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.inner.lock().waiting.front().map(|j| j.enqueued_at))
    }

    async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut state = self.inner.lock();
        let stalled: Vec<Job> = state.active.drain().map(|(_, job)| job).collect();
        let count = stalled.len();
        for mut job in stalled {
            job.increment_attempts();
            if job.should_retry() {
                state.waiting.push_back(job);
            } else {
                state
                    .dead_letter
                    .push((job, "stalled past max attempts".to_string()));
                state.failed += 1;
            }
        }
        Ok(count)
    }
}
