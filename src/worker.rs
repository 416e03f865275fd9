//! Worker pool: pulls ready tasks, runs handlers, records outcomes

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::backend::ResultBackend;
use crate::context::TaskContext;
use crate::error::TaskError;
use crate::queue::{Delivery, QueueSet, TaskQueue};
use crate::task::{Task, TaskState};

/// Outcome reported by a task handler
#[derive(Debug)]
pub enum Outcome {
    /// Handler succeeded; the value is stored as the task result
    Success(Value),
    /// Recoverable failure; retried until attempts are exhausted
    Retry(String),
    /// Non-recoverable failure; recorded immediately
    Failure(String),
}

impl From<TaskError> for Outcome {
    /// Handlers that bubble up a [`TaskError`] get the conservative mapping:
    /// definitely-bad inputs fail outright, everything else is retried.
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::HandlerFailure { message } => Outcome::Failure(message),
            fatal @ (TaskError::InvalidTask { .. } | TaskError::Serialization(_)) => {
                Outcome::Failure(fatal.to_string())
            }
            other => Outcome::Retry(other.to_string()),
        }
    }
}

/// The capability a worker invokes for each task execution
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, task: Task, ctx: TaskContext) -> Outcome;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send,
{
    async fn run(&self, task: Task, ctx: TaskContext) -> Outcome {
        (self.f)(task, ctx).await
    }
}

/// Adapt an async closure into a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> impl Handler + 'static
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    FnHandler { f }
}

/// Optional lifecycle hooks invoked by the pool after each outcome
#[async_trait]
pub trait EventHooks: Send + Sync {
    async fn on_success(&self, _task: &Task, _result: &Value) {}
    async fn on_retry(&self, _task: &Task, _reason: &str, _next_eta: DateTime<Utc>) {}
    async fn on_failure(&self, _task: &Task, _reason: &str) {}
}

/// Registry mapping task names to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Register a handler for a task name
    pub async fn register<H>(&self, task_name: String, handler: H)
    where
        H: Handler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(task_name, Arc::new(handler));
    }

    async fn find(&self, task_name: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().await;
        handlers.get(task_name).cloned()
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent execution loops
    pub workers: usize,
    /// Queue names served, in round-robin precedence
    pub queues: Vec<String>,
    /// Bounded wait per dequeue attempt; also bounds shutdown latency
    pub poll_interval: Duration,
    /// Grace period for in-flight executions on shutdown
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Worker pool counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
}

/// A fixed set of execution loops pulling from one or more queues.
///
/// Execution timeouts are advisory: at the deadline the task's visible state
/// becomes RETRY_SCHEDULED or FAILURE and the cooperative cancel flag is set,
/// but work the handler spawned without checking the flag may keep running.
/// At-least-once execution is accepted, not hidden.
pub struct WorkerPool {
    config: WorkerConfig,
    queues: Arc<QueueSet>,
    backend: Arc<dyn ResultBackend>,
    handlers: Arc<HandlerRegistry>,
    hooks: Option<Arc<dyn EventHooks>>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown: Arc<RwLock<bool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool over the given queues and result backend
    pub fn new(config: WorkerConfig, queues: Arc<QueueSet>, backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            config,
            queues,
            backend,
            handlers: Arc::new(HandlerRegistry::default()),
            hooks: None,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            shutdown: Arc::new(RwLock::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Install lifecycle hooks; call before `start`
    pub fn with_hooks(mut self, hooks: Arc<dyn EventHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Register a handler for a task name
    pub async fn register_handler<H>(&self, task_name: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        self.handlers.register(task_name.into(), handler).await;
    }

    /// Spawn the execution loops
    pub async fn start(&self) {
        let mut queue_handles = Vec::with_capacity(self.config.queues.len());
        for name in &self.config.queues {
            queue_handles.push(self.queues.get_or_create(name).await);
        }

        let mut workers = self.workers.lock().await;
        for index in 0..self.config.workers {
            let handle = tokio::spawn(Self::run_worker(
                index,
                queue_handles.clone(),
                self.queues.clone(),
                self.backend.clone(),
                self.handlers.clone(),
                self.hooks.clone(),
                self.stats.clone(),
                self.shutdown.clone(),
                self.config.poll_interval,
            ));
            workers.push(handle);
        }
        info!(
            workers = self.config.workers,
            queues = ?self.config.queues,
            "worker pool started"
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_worker(
        index: usize,
        queue_handles: Vec<Arc<TaskQueue>>,
        queues: Arc<QueueSet>,
        backend: Arc<dyn ResultBackend>,
        handlers: Arc<HandlerRegistry>,
        hooks: Option<Arc<dyn EventHooks>>,
        stats: Arc<Mutex<WorkerStats>>,
        shutdown: Arc<RwLock<bool>>,
        poll_interval: Duration,
    ) {
        if queue_handles.is_empty() {
            warn!(worker = index, "no queues configured, worker exiting");
            return;
        }
        debug!(worker = index, "worker loop started");
        let mut rotation = index; // stagger which queue each worker polls first
        loop {
            if *shutdown.read().await {
                break;
            }
            let queue = &queue_handles[rotation % queue_handles.len()];
            rotation = rotation.wrapping_add(1);

            let Some(delivery) = queue.dequeue(poll_interval).await else {
                continue;
            };
            Self::execute(delivery, queue, &queues, &backend, &handlers, &hooks, &stats).await;
        }
        debug!(worker = index, "worker loop stopped");
    }

    /// Run one dispatched task to a recorded state. Never panics outward:
    /// every outcome, including a missing handler, lands in the backend.
    async fn execute(
        delivery: Delivery,
        queue: &Arc<TaskQueue>,
        queues: &Arc<QueueSet>,
        backend: &Arc<dyn ResultBackend>,
        handlers: &Arc<HandlerRegistry>,
        hooks: &Option<Arc<dyn EventHooks>>,
        stats: &Arc<Mutex<WorkerStats>>,
    ) {
        let cancel_flag = delivery.cancel_flag();
        let task = delivery.task;
        let now = Utc::now();

        if task.is_expired(now) {
            warn!(task_id = %task.id, "task expired before dispatch");
            backend.init(task.id).await;
            backend.store_state(task.id, TaskState::Expired).await;
            queue.ack(task.id).await;
            let mut stats = stats.lock().await;
            stats.processed += 1;
            stats.expired += 1;
            return;
        }

        let attempt = task.attempt + 1;
        backend.init(task.id).await;
        backend.mark_running(task.id, attempt).await;

        let ctx = TaskContext::new(&task, backend.clone(), queues.clone(), cancel_flag.clone());
        let span = ctx.span();

        let outcome = match handlers.find(&task.name).await {
            None => Outcome::Failure(format!("no handler registered for task '{}'", task.name)),
            Some(handler) => {
                let run = handler.run(task.clone(), ctx).instrument(span);
                match tokio::time::timeout(task.timeout, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // advisory deadline: flag any still-running work
                        cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        let err = TaskError::HandlerTimeout {
                            seconds: task.timeout.as_secs(),
                        };
                        Outcome::Retry(err.to_string())
                    }
                }
            }
        };

        match outcome {
            Outcome::Success(value) => {
                info!(task_id = %task.id, attempt, "task succeeded");
                backend.store_result(task.id, value.clone()).await;
                queue.ack(task.id).await;
                let mut s = stats.lock().await;
                s.processed += 1;
                s.succeeded += 1;
                drop(s);
                if let Some(hooks) = hooks {
                    hooks.on_success(&task, &value).await;
                }
            }
            Outcome::Retry(reason) if task.can_retry() => {
                let delay = task.retry.backoff(attempt);
                let eta = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(task_id = %task.id, attempt, %reason, retry_at = %eta, "task scheduled for retry");
                let mut retried = task.clone();
                retried.reschedule(eta);
                backend.store_state(task.id, TaskState::RetryScheduled).await;
                queue.requeue(retried).await;
                let mut s = stats.lock().await;
                s.retried += 1;
                drop(s);
                if let Some(hooks) = hooks {
                    hooks.on_retry(&task, &reason, eta).await;
                }
            }
            Outcome::Retry(reason) | Outcome::Failure(reason) => {
                warn!(task_id = %task.id, attempt, %reason, "task failed");
                backend.store_error(task.id, reason.clone()).await;
                queue.ack(task.id).await;
                let mut s = stats.lock().await;
                s.processed += 1;
                s.failed += 1;
                drop(s);
                if let Some(hooks) = hooks {
                    hooks.on_failure(&task, &reason).await;
                }
            }
        }
    }

    /// Current counters
    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Stop the pool: drain in-flight executions up to the grace period,
    /// then abort stragglers. Queued-but-undispatched tasks stay in their
    /// queues for a later pool.
    pub async fn shutdown(&self) {
        info!("shutting down worker pool");
        *self.shutdown.write().await = true;

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for mut handle in handles {
            let now = tokio::time::Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("aborting worker still busy after grace period");
                handle.abort();
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::queue::TaskQueueConfig;
    use crate::task::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        queues: Arc<QueueSet>,
        backend: Arc<InMemoryBackend>,
        pool: WorkerPool,
    }

    fn fixture(workers: usize) -> Fixture {
        let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
        let backend = Arc::new(InMemoryBackend::with_default_config());
        let config = WorkerConfig {
            workers,
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        };
        let pool = WorkerPool::new(config, queues.clone(), backend.clone());
        Fixture {
            queues,
            backend,
            pool,
        }
    }

    async fn submit(fx: &Fixture, task: Task) {
        fx.backend.init(task.id).await;
        fx.queues
            .get_or_create(&task.queue)
            .await
            .enqueue(task)
            .await
            .unwrap();
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_secs: 0,
            exponential: false,
            max_delay_secs: 0,
        }
    }

    #[test]
    fn task_errors_map_to_outcomes() {
        assert!(matches!(
            Outcome::from(TaskError::handler_failure("bad input")),
            Outcome::Failure(m) if m == "bad input"
        ));
        assert!(matches!(
            Outcome::from(TaskError::invalid_task("missing field")),
            Outcome::Failure(_)
        ));
        assert!(matches!(
            Outcome::from(TaskError::not_found("missing")),
            Outcome::Retry(_)
        ));
    }

    #[tokio::test]
    async fn successful_task_stores_result() {
        let fx = fixture(1);
        fx.pool
            .register_handler("double", handler_fn(|task: Task, _ctx| async move {
                let n = task.payload["n"].as_i64().unwrap_or(0);
                Outcome::Success(json!(n * 2))
            }))
            .await;
        fx.pool.start().await;

        let task = Task::builder("double").payload(json!({"n": 21})).build().unwrap();
        let id = task.id;
        submit(&fx, task).await;

        let record = fx
            .backend
            .wait(id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.result, Some(json!(42)));
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn failing_task_is_attempted_once_plus_max_retries() {
        let fx = fixture(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        fx.pool
            .register_handler("flaky", handler_fn(move |_task, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::Retry("still broken".to_string())
                }
            }))
            .await;
        fx.pool.start().await;

        let task = Task::builder("flaky")
            .retry_policy(fast_retry(2))
            .build()
            .unwrap();
        let id = task.id;
        submit(&fx, task).await;

        let record = fx
            .backend
            .wait(id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // 1 initial + 2 retries
        assert_eq!(record.attempt, 3);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn non_recoverable_failure_is_not_retried() {
        let fx = fixture(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        fx.pool
            .register_handler("fatal", handler_fn(move |_task, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::Failure("bad input".to_string())
                }
            }))
            .await;
        fx.pool.start().await;

        let task = Task::builder("fatal")
            .retry_policy(fast_retry(5))
            .build()
            .unwrap();
        let id = task.id;
        submit(&fx, task).await;

        let record = fx
            .backend
            .wait(id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(record.error.as_deref(), Some("bad input"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn handler_deadline_is_recorded_as_failure() {
        let fx = fixture(1);
        fx.pool
            .register_handler("sleepy", handler_fn(|_task, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Outcome::Success(json!(null))
            }))
            .await;
        fx.pool.start().await;

        let task = Task::builder("sleepy")
            .timeout(Duration::from_millis(50))
            .max_retries(0)
            .build()
            .unwrap();
        let id = task.id;
        submit(&fx, task).await;

        let record = fx
            .backend
            .wait(id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Failure);
        assert!(record.error.unwrap().contains("deadline"));
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn expired_task_is_skipped_and_marked() {
        let fx = fixture(1);
        fx.pool
            .register_handler("late", handler_fn(|_task, _ctx| async move {
                Outcome::Success(json!(null))
            }))
            .await;

        // build a valid task, then force the expiry into the past before
        // the pool starts
        let mut task = Task::builder("late").build().unwrap();
        task.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let id = task.id;
        submit(&fx, task).await;

        fx.pool.start().await;
        let record = fx
            .backend
            .wait(id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Expired);

        let stats = fx.pool.stats().await;
        assert_eq!(stats.expired, 1);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn missing_handler_fails_and_worker_keeps_serving() {
        let fx = fixture(1);
        fx.pool
            .register_handler("known", handler_fn(|_task, _ctx| async move {
                Outcome::Success(json!("ok"))
            }))
            .await;
        fx.pool.start().await;

        let orphan = Task::builder("unregistered").build().unwrap();
        let orphan_id = orphan.id;
        submit(&fx, orphan).await;

        let record = fx
            .backend
            .wait(orphan_id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Failure);

        // the same worker still executes subsequent tasks
        let ok = Task::builder("known").build().unwrap();
        let ok_id = ok.id;
        submit(&fx, ok).await;
        let record = fx
            .backend
            .wait(ok_id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TaskState::Success);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn hooks_fire_per_outcome() {
        #[derive(Default)]
        struct Counting {
            successes: AtomicU32,
            retries: AtomicU32,
            failures: AtomicU32,
        }

        #[async_trait]
        impl EventHooks for Counting {
            async fn on_success(&self, _task: &Task, _result: &Value) {
                self.successes.fetch_add(1, Ordering::SeqCst);
            }
            async fn on_retry(&self, _task: &Task, _reason: &str, _next_eta: DateTime<Utc>) {
                self.retries.fetch_add(1, Ordering::SeqCst);
            }
            async fn on_failure(&self, _task: &Task, _reason: &str) {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }

        let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
        let backend = Arc::new(InMemoryBackend::with_default_config());
        let hooks = Arc::new(Counting::default());
        let config = WorkerConfig {
            workers: 1,
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        };
        let pool = WorkerPool::new(config, queues.clone(), backend.clone())
            .with_hooks(hooks.clone());
        pool.register_handler("flaky", handler_fn(|_task, _ctx| async move {
            Outcome::Retry("transient".to_string())
        }))
        .await;
        pool.start().await;

        let task = Task::builder("flaky")
            .retry_policy(fast_retry(1))
            .build()
            .unwrap();
        let id = task.id;
        backend.init(id).await;
        queues
            .get_or_create(&task.queue)
            .await
            .enqueue(task)
            .await
            .unwrap();

        backend.wait(id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(hooks.retries.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.successes.load(Ordering::SeqCst), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pool_serves_several_queues_round_robin() {
        let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
        let backend = Arc::new(InMemoryBackend::with_default_config());
        let config = WorkerConfig {
            workers: 2,
            queues: vec!["alpha".to_string(), "beta".to_string()],
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
        };
        let pool = WorkerPool::new(config, queues.clone(), backend.clone());
        pool.register_handler("echo", handler_fn(|task: Task, _ctx| async move {
            Outcome::Success(task.payload)
        }))
        .await;
        pool.start().await;

        let mut submitted = Vec::new();
        for (i, queue) in ["alpha", "beta", "alpha", "beta"].iter().enumerate() {
            let task = Task::builder("echo")
                .queue(*queue)
                .payload(json!(i))
                .build()
                .unwrap();
            submitted.push((task.id, i));
            backend.init(task.id).await;
            queues
                .get_or_create(queue)
                .await
                .enqueue(task)
                .await
                .unwrap();
        }

        for (id, i) in submitted {
            let record = backend
                .wait(id, Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.state, TaskState::Success);
            assert_eq!(record.result, Some(json!(i)));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_workers() {
        let fx = fixture(2);
        fx.pool.start().await;
        fx.pool.shutdown().await;
        assert!(fx.pool.workers.lock().await.is_empty());
    }
}
