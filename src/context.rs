//! Per-execution handle passed to task handlers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::Span;

use crate::backend::ResultBackend;
use crate::error::TaskResult;
use crate::queue::QueueSet;
use crate::task::{Task, TaskId, TaskState};

/// Handle bound to one execution of one task.
///
/// Lets the handler report progress, persist checkpoints for resumption
/// after a retry, poll for cooperative cancellation, and spawn dependent
/// tasks for chain or aggregation workflows.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_name: String,
    attempt: u32,
    backend: Arc<dyn ResultBackend>,
    queues: Arc<QueueSet>,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(
        task: &Task,
        backend: Arc<dyn ResultBackend>,
        queues: Arc<QueueSet>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            attempt: task.attempt + 1,
            backend,
            queues,
            cancelled,
        }
    }

    /// Id of the task this execution belongs to
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Handler routing key of the task
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Execution attempt number, 1-based
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forward progress to the result backend; best-effort, never fails the
    /// handler.
    pub async fn report_progress<S: Into<String>>(&self, percent: u8, message: S) {
        self.backend
            .store_progress(self.task_id, percent, message.into())
            .await;
    }

    /// Persist an opaque checkpoint so a retried attempt can resume instead
    /// of restarting from scratch. The engine never interprets the contents.
    pub async fn checkpoint(&self, value: Value) {
        self.backend.store_checkpoint(self.task_id, value).await;
    }

    /// The checkpoint written by a previous attempt, if any
    pub async fn last_checkpoint(&self) -> Option<Value> {
        self.backend.checkpoint(self.task_id).await
    }

    /// Cooperative cancellation flag; handlers are expected to poll this
    /// during long-running work.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Enqueue a dependent task from within the handler
    pub async fn spawn_subtask(&self, task: Task) -> TaskResult<TaskId> {
        let id = task.id;
        let queue_name = task.queue.clone();
        let created = self.backend.init(id).await;
        let queue = self.queues.get_or_create(&queue_name).await;
        if let Err(e) = queue.enqueue(task).await {
            // release the fresh record so cleanup can reclaim it
            if created {
                self.backend.store_state(id, TaskState::Cancelled).await;
            }
            return Err(e);
        }
        tracing::debug!(task_id = %self.task_id, subtask_id = %id, "spawned subtask");
        Ok(id)
    }

    /// A span tagging every log line with the task id for correlation
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "task",
            task_id = %self.task_id,
            task = %self.task_name,
            attempt = self.attempt
        )
    }
}
