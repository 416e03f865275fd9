//! Error types for the task queue engine

use thiserror::Error;

/// Result type alias for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error types surfaced by the task queue system.
///
/// Timeouts on `dequeue` and `wait` are not errors: those operations return
/// `None` when their budget elapses. Execution-time failures are recorded in
/// the result backend rather than propagated across the worker boundary.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Malformed or contradictory task metadata, rejected at build time
    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },

    /// Malformed cron schedule expression
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// Unknown task id on lookup or cancel
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    /// Bounded queue at capacity
    #[error("queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: String, capacity: usize },

    /// User handler reported a non-recoverable failure
    #[error("handler failure: {message}")]
    HandlerFailure { message: String },

    /// Handler exceeded its execution deadline
    #[error("handler exceeded its deadline of {seconds}s")]
    HandlerTimeout { seconds: u64 },

    /// Unknown schedule entry name
    #[error("schedule entry not found: {name}")]
    UnknownEntry { name: String },

    /// Payload serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors for wrapping other error types
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create an invalid-task error
    pub fn invalid_task<S: Into<String>>(reason: S) -> Self {
        Self::InvalidTask {
            reason: reason.into(),
        }
    }

    /// Create an invalid-expression error
    pub fn invalid_expression<E: Into<String>, R: Into<String>>(expr: E, reason: R) -> Self {
        Self::InvalidExpression {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: ToString>(task_id: S) -> Self {
        Self::NotFound {
            task_id: task_id.to_string(),
        }
    }

    /// Create a handler-failure error
    pub fn handler_failure<S: Into<String>>(message: S) -> Self {
        Self::HandlerFailure {
            message: message.into(),
        }
    }

    /// Create an unknown-entry error
    pub fn unknown_entry<S: Into<String>>(name: S) -> Self {
        Self::UnknownEntry { name: name.into() }
    }
}
