//! # Taskmill
//!
//! An in-process task queue engine: clients submit units of work with
//! priority, delay, deadline, retry and tag metadata; a worker pool pulls
//! and executes them; an in-memory result backend tracks state, progress
//! and output; a scheduler re-submits tasks on cron or fixed-interval
//! cadences.
//!
//! ## Features
//!
//! - Priority queues with delayed-task promotion
//! - Bounded worker pools with graceful shutdown
//! - Automatic retries with exponential backoff
//! - Blocking result waits without busy-polling
//! - Progress reporting, checkpoints and cooperative cancellation
//! - Cron and interval schedules
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use taskmill::{
//!     handler_fn, InMemoryBackend, Outcome, QueueSet, Task, TaskClient,
//!     TaskQueueConfig, WorkerConfig, WorkerPool,
//! };
//!
//! # async fn demo() -> taskmill::TaskResult<()> {
//! let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
//! let backend = Arc::new(InMemoryBackend::with_default_config());
//! let client = TaskClient::new(queues.clone(), backend.clone());
//!
//! let pool = WorkerPool::new(WorkerConfig::default(), queues, backend);
//! pool.register_handler("greet", handler_fn(|task: Task, _ctx| async move {
//!     Outcome::Success(json!(format!("hello, {}", task.payload["name"])))
//! }))
//! .await;
//! pool.start().await;
//!
//! let handle = client
//!     .submit(Task::builder("greet").payload(json!({"name": "mill"})).build()?)
//!     .await?;
//! let record = handle.wait(Duration::from_secs(5)).await?;
//! println!("{:?}", record);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod context;
pub mod cron;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use backend::{InMemoryBackend, InMemoryBackendConfig, Progress, ResultBackend, ResultRecord};
pub use client::{AsyncResult, TaskClient};
pub use context::TaskContext;
pub use cron::CronExpr;
pub use error::{TaskError, TaskResult};
pub use queue::{Delivery, QueueSet, TaskQueue, TaskQueueConfig};
pub use scheduler::{ScheduleEntry, ScheduleSpec, Scheduler, TaskTemplate};
pub use task::{Priority, RetryPolicy, Task, TaskBuilder, TaskId, TaskState};
pub use worker::{
    handler_fn, EventHooks, Handler, HandlerRegistry, Outcome, WorkerConfig, WorkerPool,
    WorkerStats,
};

/// Version of the taskmill library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
