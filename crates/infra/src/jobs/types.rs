//! Core job types and policies.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use hireflow_core::JobId;

/// A job as it sits on the broker.
///
/// The body of every message on the main queue, delay queues and DLQ is this struct
/// serialized as JSON (camelCase field names).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage<T> {
    pub id: JobId,
    pub job_name: String,
    pub data: T,
    /// Failed processing attempts so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest processing time, set only for delayed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl<T> JobMessage<T> {
    pub fn new(job_name: impl Into<String>, data: T) -> Self {
        let job_name = job_name.into();
        Self {
            id: JobId::generate(&job_name),
            job_name,
            data,
            attempts: 0,
            created_at: Utc::now(),
            scheduled_for: None,
        }
    }

    /// Stamp `scheduled_for` as `now + delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_for = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Same envelope, different payload.
    pub fn with_data<U>(self, data: U) -> JobMessage<U> {
        JobMessage {
            id: self.id,
            job_name: self.job_name,
            data,
            attempts: self.attempts,
            created_at: self.created_at,
            scheduled_for: self.scheduled_for,
        }
    }
}

/// Options for [`JobQueue::add_job`](super::JobQueue::add_job).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Hold the job back for this long before it becomes visible to workers.
    pub delay: Option<Duration>,
    /// Passed to the broker as a message property; the main queue is not a priority queue.
    pub priority: Option<u8>,
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Options for [`JobQueue::start_worker`](super::JobQueue::start_worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Prefetch count: jobs processed at once. `1` gives strict FIFO.
    pub concurrency: u16,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(concurrency: u16) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

/// Retry policy: exponential backoff, no cap, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Processing attempts before the job is dead-lettered.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// `attempts` is the count of failures so far, including the one just seen.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure(String),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for JobResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

/// Processes jobs of one payload type.
///
/// Implemented for any `Fn(JobMessage<T>) -> impl Future<Output = JobResult>`. A panic
/// inside `process` counts as a failed attempt.
#[async_trait]
pub trait JobProcessor<T>: Send + Sync + 'static {
    async fn process(&self, job: JobMessage<T>) -> JobResult;
}

#[async_trait]
impl<T, F, Fut> JobProcessor<T> for F
where
    T: Send + 'static,
    F: Fn(JobMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn process(&self, job: JobMessage<T>) -> JobResult {
        (self)(job).await
    }
}
