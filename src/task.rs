//! Task definitions and the validating builder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Task execution state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Task is waiting to be dispatched
    Pending,
    /// Task is currently being executed by a worker
    Running,
    /// Task completed successfully
    Success,
    /// Task failed with an error
    Failure,
    /// Task failed and has been re-enqueued for a later attempt
    RetryScheduled,
    /// Task was cancelled before dispatch
    Cancelled,
    /// Task's expiry passed before it could run
    Expired,
}

impl TaskState {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Cancelled | TaskState::Expired
        )
    }
}

/// Task priority within the fixed range `0..=9`; higher runs sooner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(9);
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(8);

    /// Create a priority, rejecting values outside the fixed range
    pub fn new(value: u8) -> TaskResult<Self> {
        if value > Self::MAX.0 {
            return Err(TaskError::invalid_task(format!(
                "priority {} outside range {}..={}",
                value,
                Self::MIN.0,
                Self::MAX.0
            )));
        }
        Ok(Priority(value))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Configuration for task retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries in seconds
    pub base_delay_secs: u64,
    /// Whether to use exponential backoff
    pub exponential: bool,
    /// Maximum delay between retries in seconds
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 5,
            exponential: true,
            max_delay_secs: 300, // 5 minutes
        }
    }
}

impl RetryPolicy {
    /// Delay to apply before the given retry attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = if self.exponential {
            let shift = attempt.saturating_sub(1).min(32);
            self.base_delay_secs
                .saturating_mul(2_u64.saturating_pow(shift))
                .min(self.max_delay_secs)
        } else {
            self.base_delay_secs
        };
        Duration::from_secs(secs)
    }
}

/// One unit of work: immutable after build, except for the attempt counter
/// and eta which the worker pool advances on retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, assigned at build time
    pub id: TaskId,
    /// Handler routing key
    pub name: String,
    /// Opaque serialized payload
    pub payload: Value,
    /// Dispatch priority
    pub priority: Priority,
    /// Queue this task is submitted to
    pub queue: String,
    /// Execution deadline for a single attempt
    pub timeout: Duration,
    /// Retry configuration
    pub retry: RetryPolicy,
    /// Current attempt, 0 before the first execution
    pub attempt: u32,
    /// Earliest instant at which the task may run
    pub eta: Option<DateTime<Utc>>,
    /// Instant after which the task must not run
    pub expires_at: Option<DateTime<Utc>>,
    /// Labels usable for bulk cancellation
    pub tags: BTreeSet<String>,
    /// When the task was built
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Start building a task with the given handler name
    pub fn builder<S: Into<String>>(name: S) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// Whether the task's expiry has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }

    /// Whether the task's eta (if any) has passed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.eta {
            Some(eta) => eta <= now,
            None => true,
        }
    }

    /// Whether another attempt is allowed after a recoverable failure
    pub fn can_retry(&self) -> bool {
        self.attempt < self.retry.max_retries
    }

    /// Advance the attempt counter and set the eta for the next try
    pub(crate) fn reschedule(&mut self, eta: DateTime<Utc>) {
        self.attempt += 1;
        self.eta = Some(eta);
    }
}

/// Fluent builder for [`Task`]; `build` validates and never coerces.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    payload: Value,
    priority: Priority,
    queue: String,
    timeout: Duration,
    retry: RetryPolicy,
    eta: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    tags: BTreeSet<String>,
}

impl TaskBuilder {
    fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            priority: Priority::default(),
            queue: "default".to_string(),
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            eta: None,
            expires_at: None,
            tags: BTreeSet::new(),
        }
    }

    /// Set the opaque payload
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize any serde value as the payload
    pub fn payload_from<T: Serialize>(mut self, value: &T) -> TaskResult<Self> {
        self.payload = serde_json::to_value(value)?;
        Ok(self)
    }

    /// Set the dispatch priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the target queue name
    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the per-attempt execution deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum number of retries
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Replace the whole retry policy
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set an absolute earliest-run instant
    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Set the eta relative to now
    pub fn delay(mut self, delay: Duration) -> Self {
        self.eta = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Set an absolute expiry instant
    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Add a single tag
    pub fn tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Validate and build the task, assigning a fresh id
    pub fn build(self) -> TaskResult<Task> {
        if self.name.trim().is_empty() {
            return Err(TaskError::invalid_task("task name must not be empty"));
        }
        if self.queue.trim().is_empty() {
            return Err(TaskError::invalid_task("queue name must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(TaskError::invalid_task("timeout must be greater than zero"));
        }
        if let (Some(eta), Some(expiry)) = (self.eta, self.expires_at) {
            if eta > expiry {
                return Err(TaskError::invalid_task(format!(
                    "eta {} is after expiry {}",
                    eta, expiry
                )));
            }
        }

        Ok(Task {
            id: TaskId::new_v4(),
            name: self.name,
            payload: self.payload,
            priority: self.priority,
            queue: self.queue,
            timeout: self.timeout,
            retry: self.retry,
            attempt: 0,
            eta: self.eta,
            expires_at: self.expires_at,
            tags: self.tags,
            created_at: Utc::now(),
        })
    }
}
