//! Client interface for submitting tasks and observing their results

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::backend::{ResultBackend, ResultRecord};
use crate::error::TaskResult;
use crate::queue::QueueSet;
use crate::task::{Task, TaskId, TaskState};

/// Client-facing submission API over a queue set and a result backend.
///
/// Build-time and submission-time errors come back synchronously; execution
/// outcomes are observed through the returned [`AsyncResult`] handles.
pub struct TaskClient {
    queues: Arc<QueueSet>,
    backend: Arc<dyn ResultBackend>,
}

impl TaskClient {
    pub fn new(queues: Arc<QueueSet>, backend: Arc<dyn ResultBackend>) -> Self {
        Self { queues, backend }
    }

    /// The queue set this client submits into
    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }

    /// The backend this client reads results from
    pub fn backend(&self) -> &Arc<dyn ResultBackend> {
        &self.backend
    }

    /// Submit a task to its queue, returning a handle for its result.
    ///
    /// The result record is created before the task becomes dequeueable, so
    /// a waiter can never observe a submitted id as unknown.
    pub async fn submit(&self, task: Task) -> TaskResult<AsyncResult> {
        let id = task.id;
        let queue_name = task.queue.clone();
        let created = self.backend.init(id).await;
        let queue = self.queues.get_or_create(&queue_name).await;
        if let Err(e) = queue.enqueue(task).await {
            // release the fresh record so cleanup can reclaim it; an already
            // existing record belongs to the live task with this id
            if created {
                self.backend.store_state(id, TaskState::Cancelled).await;
            }
            return Err(e);
        }
        debug!(task_id = %id, queue = %queue_name, "submitted task");
        Ok(AsyncResult {
            id,
            backend: self.backend.clone(),
        })
    }

    /// Submit a batch; one bad task never blocks the rest, each item gets
    /// its own outcome.
    pub async fn submit_bulk(&self, tasks: Vec<Task>) -> Vec<TaskResult<AsyncResult>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.submit(task).await);
        }
        results
    }

    /// Cancel a task not yet dispatched. Returns true when the task was
    /// removed before execution (guaranteed not to run); false if it is
    /// already running (its cooperative flag is set instead) or unknown.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let cancelled = self.queues.cancel(id).await;
        if cancelled {
            self.backend.store_state(id, TaskState::Cancelled).await;
        }
        cancelled
    }

    /// Cancel every pending or delayed task carrying the tag, across all
    /// queues; running tasks are unaffected. Each removed task's record is
    /// marked Cancelled.
    pub async fn cancel_by_tag(&self, tag: &str) -> usize {
        let cancelled = self.queues.take_by_tag(tag).await;
        for id in &cancelled {
            self.backend.store_state(*id, TaskState::Cancelled).await;
        }
        cancelled.len()
    }

    /// Non-blocking status lookup
    pub async fn get_status(&self, id: TaskId) -> Option<ResultRecord> {
        self.backend.get(id).await
    }

    /// Handle for a previously submitted task id
    pub fn result_handle(&self, id: TaskId) -> AsyncResult {
        AsyncResult {
            id,
            backend: self.backend.clone(),
        }
    }
}

/// Async handle to one task's result
#[derive(Clone)]
pub struct AsyncResult {
    id: TaskId,
    backend: Arc<dyn ResultBackend>,
}

impl AsyncResult {
    /// The submitted task's id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Non-blocking read of the current record
    pub async fn poll(&self) -> Option<ResultRecord> {
        self.backend.get(self.id).await
    }

    /// Block until the task reaches a terminal state or the timeout elapses;
    /// `Ok(None)` means timed out.
    pub async fn wait(&self, timeout: Duration) -> TaskResult<Option<ResultRecord>> {
        self.backend.wait(self.id, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::queue::{TaskQueueConfig, QueueSet};

    fn client() -> TaskClient {
        let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
        let backend = Arc::new(InMemoryBackend::with_default_config());
        TaskClient::new(queues, backend)
    }

    #[tokio::test]
    async fn submit_creates_record_before_enqueue() {
        let client = client();
        let task = Task::builder("t").build().unwrap();
        let handle = client.submit(task).await.unwrap();

        let record = handle.poll().await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(client.queues().sizes().await["default"], 1);
    }

    #[tokio::test]
    async fn cancel_before_dispatch_records_cancelled() {
        let client = client();
        let task = Task::builder("t").build().unwrap();
        let handle = client.submit(task).await.unwrap();

        assert!(client.cancel(handle.id()).await);
        let record = client.get_status(handle.id()).await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);

        // wait resolves immediately on the terminal record
        let waited = handle.wait(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(waited.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn result_handle_observes_a_prior_submission() {
        let client = client();
        let task = Task::builder("t").build().unwrap();
        let id = client.submit(task).await.unwrap().id();
        assert!(client.cancel(id).await);

        // a handle built from just the id sees the same record
        let handle = client.result_handle(id);
        let record = handle.wait(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_false() {
        let client = client();
        assert!(!client.cancel(TaskId::new_v4()).await);
    }

    #[tokio::test]
    async fn submit_bulk_reports_per_item() {
        let client = client();
        let a = Task::builder("a").build().unwrap();
        let duplicate = a.clone();
        let b = Task::builder("b").build().unwrap();

        let results = client.submit_bulk(vec![a, duplicate, b]).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn failed_submission_releases_only_fresh_records() {
        let queues = Arc::new(QueueSet::new(TaskQueueConfig {
            capacity: Some(1),
            ..Default::default()
        }));
        let backend = Arc::new(InMemoryBackend::with_default_config());
        let client = TaskClient::new(queues, backend);

        let a = Task::builder("a").build().unwrap();
        let a_id = a.id;
        let duplicate = a.clone();
        client.submit(a).await.unwrap();

        // rejected over capacity: its fresh record is released
        let b = Task::builder("b").build().unwrap();
        let b_id = b.id;
        assert!(client.submit(b).await.is_err());
        let record = client.get_status(b_id).await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);

        // rejected duplicate: the live task's record is left untouched
        assert!(client.submit(duplicate).await.is_err());
        let record = client.get_status(a_id).await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn cancel_by_tag_spans_queues() {
        let client = client();
        let a = Task::builder("a").queue("q1").tag("batch").build().unwrap();
        let b = Task::builder("b").queue("q2").tag("batch").build().unwrap();
        let c = Task::builder("c").queue("q2").build().unwrap();
        client.submit(a).await.unwrap();
        client.submit(b).await.unwrap();
        client.submit(c).await.unwrap();

        assert_eq!(client.cancel_by_tag("batch").await, 2);
        assert_eq!(client.cancel_by_tag("batch").await, 0);
        let sizes = client.queues().sizes().await;
        assert_eq!(sizes["q1"], 0);
        assert_eq!(sizes["q2"], 1);
    }
}
