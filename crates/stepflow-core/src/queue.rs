// Copyright (c) 2025 Stepflow Team
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Job queue: interface plus the reference in-memory implementation.
//!
//! The in-memory queue is bounded, orders by priority (descending) with
//! FIFO inside a priority class, enforces a running-job cap, and re-inserts
//! failed jobs that still have retry budget after their delay. Completed
//! and failed jobs stay queryable for a retention TTL. All mutations are
//! serialized behind one lock, so enqueue/dequeue/complete/fail are atomic
//! under concurrent workers.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// What a job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Workflow,
    Step,
}

/// Queue lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

/// Job priority; higher dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Bookkeeping timestamps and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When a worker picked it up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution wall time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Free-form tags (schedule ids, trigger sources, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            tags: Vec::new(),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub id: String,
    /// Workflow the job belongs to.
    pub workflow_id: String,
    /// Step id for step-scoped jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Job type.
    pub job_type: JobType,
    /// Payload passed to the worker (inputs, trigger data).
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Current status.
    pub status: JobStatus,
    /// Priority class.
    #[serde(default)]
    pub priority: JobPriority,
    /// Times a worker has started this job.
    #[serde(default)]
    pub attempts: u32,
    /// Retry budget after failures.
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before a retry becomes dequeueable.
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Errors collected across attempts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Result recorded on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Bookkeeping.
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Job-level timeout hint for the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Ids of jobs that must finish first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl Job {
    /// Creates a workflow job with defaults.
    pub fn workflow(workflow_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            step_id: None,
            job_type: JobType::Workflow,
            payload,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            attempts: 0,
            max_retries: 0,
            retry_delay_ms: 1000,
            errors: Vec::new(),
            result: None,
            metadata: JobMetadata::default(),
            timeout_ms: None,
            dependencies: Vec::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// All jobs currently known to the queue (any status).
    pub total: usize,
    /// Count per status.
    pub by_status: HashMap<String, usize>,
    /// Average wait between enqueue and first dequeue, in milliseconds.
    pub avg_wait_ms: f64,
    /// Average execution time of finished jobs, in milliseconds.
    pub avg_execution_ms: f64,
}

/// Job queue contract; implementations must make every operation atomic
/// under concurrent access.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds a job; fails with `QueueFull` at capacity.
    async fn enqueue(&self, job: Job) -> Result<String>;

    /// Takes the next dequeueable job, marking it running. Returns `None`
    /// when nothing is available or the running cap is reached.
    async fn dequeue(&self) -> Option<Job>;

    /// Marks a running job completed.
    async fn mark_completed(&self, job_id: &str, result: serde_json::Value) -> Result<()>;

    /// Marks a running job failed; re-inserts it when retry budget remains.
    async fn mark_failed(&self, job_id: &str, error: String) -> Result<()>;

    /// Looks up a job by id.
    async fn get(&self, job_id: &str) -> Option<Job>;

    /// Jobs that are pending, retrying or running.
    async fn active_jobs(&self) -> Vec<Job>;

    /// Queue statistics.
    async fn stats(&self) -> QueueStats;

    /// Resolves when a job may be available for dequeue.
    async fn wait_for_work(&self);
}

/// Configuration of the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum pending + retrying jobs.
    pub max_size: usize,
    /// Maximum concurrently running jobs.
    pub max_concurrent: usize,
    /// How long finished jobs stay queryable.
    pub retention_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1024,
            max_concurrent: 16,
            retention_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    job_id: String,
    priority: JobPriority,
    seq: u64,
    available_at: Instant,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    pending: Vec<PendingEntry>,
    running: usize,
    seq: u64,
    finished_at: HashMap<String, Instant>,
    wait_samples: (f64, u64),
    exec_samples: (f64, u64),
}

/// Reference in-memory queue.
pub struct InMemoryJobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
}

impl InMemoryJobQueue {
    /// Creates a queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    fn purge_expired(&self, state: &mut QueueState) {
        let ttl = self.config.retention_ttl;
        let now = Instant::now();
        let expired: Vec<String> = state
            .finished_at
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            state.finished_at.remove(&id);
            state.jobs.remove(&id);
        }
    }

    fn pick_next(&self, state: &mut QueueState) -> Option<String> {
        if state.running >= self.config.max_concurrent {
            return None;
        }
        let now = Instant::now();
        let best = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.available_at <= now)
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)?;
        Some(state.pending.remove(best).job_id)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, mut job: Job) -> Result<String> {
        let mut state = self.state.lock();
        self.purge_expired(&mut state);
        if state.pending.len() >= self.config.max_size {
            return Err(EngineError::QueueFull {
                max_size: self.config.max_size,
            });
        }
        job.status = JobStatus::Pending;
        job.metadata.created_at = Utc::now();
        let id = job.id.clone();
        state.seq += 1;
        let entry = PendingEntry {
            job_id: id.clone(),
            priority: job.priority,
            seq: state.seq,
            available_at: Instant::now(),
        };
        debug!(job_id = %id, priority = ?job.priority, "Enqueued job");
        state.jobs.insert(id.clone(), job);
        state.pending.push(entry);
        drop(state);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn dequeue(&self) -> Option<Job> {
        let mut state = self.state.lock();
        self.purge_expired(&mut state);
        let job_id = self.pick_next(&mut state)?;
        let now = Utc::now();
        let (job, wait_sample) = {
            let job = state.jobs.get_mut(&job_id)?;
            job.status = JobStatus::Running;
            job.attempts += 1;
            let wait = if job.metadata.started_at.is_none() {
                Some((now - job.metadata.created_at).num_milliseconds().max(0) as f64)
            } else {
                None
            };
            job.metadata.started_at = Some(now);
            (job.clone(), wait)
        };
        state.running += 1;
        if let Some(wait) = wait_sample {
            state.wait_samples.0 += wait;
            state.wait_samples.1 += 1;
        }
        Some(job)
    }

    async fn mark_completed(&self, job_id: &str, result: serde_json::Value) -> Result<()> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let duration = {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.metadata.completed_at = Some(now);
            let duration = job
                .metadata
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
            job.metadata.duration_ms = duration;
            duration
        };
        if let Some(duration) = duration {
            state.exec_samples.0 += duration as f64;
            state.exec_samples.1 += 1;
        }
        state.running = state.running.saturating_sub(1);
        state.finished_at.insert(job_id.to_string(), Instant::now());
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, error: String) -> Result<()> {
        let mut state = self.state.lock();
        let (retry_entry, exec_duration) = {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            job.errors.push(error);
            if job.attempts <= job.max_retries {
                job.status = JobStatus::Retrying;
                debug!(
                    job_id = %job_id,
                    attempts = job.attempts,
                    max_retries = job.max_retries,
                    "Job failed, scheduling retry"
                );
                let entry = (
                    job.priority,
                    Instant::now() + Duration::from_millis(job.retry_delay_ms),
                );
                (Some(entry), None)
            } else {
                let now = Utc::now();
                job.status = JobStatus::Failed;
                job.metadata.completed_at = Some(now);
                let duration = job
                    .metadata
                    .started_at
                    .map(|started| (now - started).num_milliseconds().max(0) as u64);
                job.metadata.duration_ms = duration;
                (None, duration)
            }
        };
        if let Some(duration) = exec_duration {
            state.exec_samples.0 += duration as f64;
            state.exec_samples.1 += 1;
        }
        state.running = state.running.saturating_sub(1);
        match retry_entry {
            Some((priority, available_at)) => {
                state.seq += 1;
                let entry = PendingEntry {
                    job_id: job_id.to_string(),
                    priority,
                    seq: state.seq,
                    available_at,
                };
                state.pending.push(entry);
            }
            None => {
                state.finished_at.insert(job_id.to_string(), Instant::now());
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Option<Job> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    async fn active_jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|j| {
                matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::Running | JobStatus::Retrying
                )
            })
            .cloned()
            .collect()
    }

    async fn stats(&self) -> QueueStats {
        let mut state = self.state.lock();
        self.purge_expired(&mut state);
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for job in state.jobs.values() {
            let key = serde_json::to_value(job.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| format!("{:?}", job.status));
            *by_status.entry(key).or_insert(0) += 1;
        }
        let avg = |(sum, n): (f64, u64)| if n == 0 { 0.0 } else { sum / n as f64 };
        QueueStats {
            total: state.jobs.len(),
            by_status,
            avg_wait_ms: avg(state.wait_samples),
            avg_execution_ms: avg(state.exec_samples),
        }
    }

    async fn wait_for_work(&self) {
        // Retrying jobs become available on a timer rather than a notify,
        // so workers also wake periodically.
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> InMemoryJobQueue {
        InMemoryJobQueue::new(QueueConfig {
            max_size: 8,
            max_concurrent: 4,
            retention_ttl: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_fifo() {
        let q = queue();
        let low = q
            .enqueue(Job::workflow("w", serde_json::json!({})).with_priority(JobPriority::Low))
            .await
            .unwrap();
        let normal_1 = q
            .enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();
        let critical = q
            .enqueue(
                Job::workflow("w", serde_json::json!({})).with_priority(JobPriority::Critical),
            )
            .await
            .unwrap();
        let normal_2 = q
            .enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();

        let order: Vec<String> = [
            q.dequeue().await.unwrap().id,
            q.dequeue().await.unwrap().id,
            q.dequeue().await.unwrap().id,
            q.dequeue().await.unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![critical, normal_1, normal_2, low]);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let q = InMemoryJobQueue::new(QueueConfig {
            max_size: 1,
            ..QueueConfig::default()
        });
        q.enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();
        let err = q
            .enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { max_size: 1 }));
    }

    #[tokio::test]
    async fn running_cap_blocks_dequeue() {
        let q = InMemoryJobQueue::new(QueueConfig {
            max_concurrent: 1,
            ..QueueConfig::default()
        });
        q.enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();
        q.enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();

        let first = q.dequeue().await.unwrap();
        assert!(q.dequeue().await.is_none());
        q.mark_completed(&first.id, serde_json::json!({})).await.unwrap();
        assert!(q.dequeue().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_with_budget_is_retried_after_delay() {
        let q = queue();
        let id = q
            .enqueue(Job::workflow("w", serde_json::json!({})).with_retries(1, 50))
            .await
            .unwrap();

        let job = q.dequeue().await.unwrap();
        assert_eq!(job.attempts, 1);
        q.mark_failed(&job.id, "boom".into()).await.unwrap();
        assert_eq!(q.get(&id).await.unwrap().status, JobStatus::Retrying);

        // Not yet available.
        assert!(q.dequeue().await.is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let retried = q.dequeue().await.unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.attempts, 2);

        // Budget exhausted now.
        q.mark_failed(&id, "boom again".into()).await.unwrap();
        let job = q.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 2);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let q = queue();
        let a = q
            .enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();
        q.enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();
        let job = q.dequeue().await.unwrap();
        assert_eq!(job.id, a);
        q.mark_completed(&a, serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let stats = q.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn retention_ttl_purges_finished_jobs() {
        let q = InMemoryJobQueue::new(QueueConfig {
            retention_ttl: Duration::from_millis(10),
            ..QueueConfig::default()
        });
        let id = q
            .enqueue(Job::workflow("w", serde_json::json!({})))
            .await
            .unwrap();
        let job = q.dequeue().await.unwrap();
        q.mark_completed(&job.id, serde_json::json!({})).await.unwrap();
        assert!(q.get(&id).await.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = q.stats().await;
        assert!(q.get(&id).await.is_none());
    }
}
