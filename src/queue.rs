//! In-memory task queues with priority ordering and delayed-task promotion

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, trace};

use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskId};

/// Configuration for a task queue
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Upper bound on queued (ready + delayed) tasks; `None` means unbounded
    pub capacity: Option<usize>,
    /// Upper bound on how long an idle dequeue sleeps between promotion checks
    pub promotion_interval: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            promotion_interval: Duration::from_millis(100),
        }
    }
}

/// Heap key for ready tasks: max priority first, FIFO among equal priority
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: u8,
    seq: u64,
    id: TaskId,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Heap key for delayed tasks: earliest eta first
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedKey {
    eta: DateTime<Utc>,
    seq: u64,
    id: TaskId,
}

/// Where a registered task currently lives
enum Location {
    Ready,
    Delayed,
    Running(Arc<AtomicBool>),
}

struct Slot {
    task: Task,
    seq: u64,
    location: Location,
}

/// A task handed to a worker, carrying its cooperative cancel flag
#[derive(Debug)]
pub struct Delivery {
    pub task: Task,
    cancelled: Arc<AtomicBool>,
}

impl Delivery {
    /// The cooperative cancellation flag shared with `cancel(id)`
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

#[derive(Default)]
struct Inner {
    ready: BinaryHeap<ReadyKey>,
    delayed: BinaryHeap<Reverse<DelayedKey>>,
    registry: HashMap<TaskId, Slot>,
    tags: HashMap<String, HashSet<TaskId>>,
    next_seq: u64,
    queued: usize,
}

impl Inner {
    /// Register a task under its id and place it in the right structure.
    /// Cancelled entries stay in the heaps and are skipped lazily on pop.
    fn insert(&mut self, task: Task, now: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let location = if task.is_due(now) {
            self.ready.push(ReadyKey {
                priority: task.priority.get(),
                seq,
                id: task.id,
            });
            Location::Ready
        } else {
            self.delayed.push(Reverse(DelayedKey {
                eta: task.eta.unwrap_or(now),
                seq,
                id: task.id,
            }));
            Location::Delayed
        };

        for tag in &task.tags {
            self.tags.entry(tag.clone()).or_default().insert(task.id);
        }
        self.registry.insert(task.id, Slot { task, seq, location });
        self.queued += 1;
    }

    /// Move every delayed task whose eta has elapsed into the ready structure
    fn promote_due(&mut self, now: DateTime<Utc>) {
        loop {
            match self.delayed.peek() {
                Some(Reverse(key)) if key.eta <= now => {}
                _ => break,
            }
            let Some(Reverse(key)) = self.delayed.pop() else {
                break;
            };
            if let Some(slot) = self.registry.get_mut(&key.id) {
                if matches!(slot.location, Location::Delayed) {
                    trace!(task_id = %key.id, "promoting delayed task");
                    self.ready.push(ReadyKey {
                        priority: slot.task.priority.get(),
                        seq: slot.seq,
                        id: key.id,
                    });
                    slot.location = Location::Ready;
                }
            }
        }
    }

    /// Pop the best ready task, skipping entries cancelled since insertion
    fn pop_ready(&mut self) -> Option<Delivery> {
        while let Some(key) = self.ready.pop() {
            if let Some(slot) = self.registry.get_mut(&key.id) {
                if matches!(slot.location, Location::Ready) {
                    let flag = Arc::new(AtomicBool::new(false));
                    slot.location = Location::Running(flag.clone());
                    self.queued -= 1;
                    return Some(Delivery {
                        task: slot.task.clone(),
                        cancelled: flag,
                    });
                }
            }
        }
        None
    }

    /// Drop a queued (non-running) task from the registry and tag index
    fn remove_queued(&mut self, id: TaskId) -> bool {
        let is_queued = matches!(
            self.registry.get(&id),
            Some(slot) if !matches!(slot.location, Location::Running(_))
        );
        if !is_queued {
            return false;
        }
        match self.registry.remove(&id) {
            Some(slot) => {
                self.strip_tags(&slot.task);
                self.queued -= 1;
                true
            }
            None => false,
        }
    }

    fn strip_tags(&mut self, task: &Task) {
        for tag in &task.tags {
            if let Some(ids) = self.tags.get_mut(tag) {
                ids.remove(&task.id);
                if ids.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn next_eta(&self) -> Option<DateTime<Utc>> {
        self.delayed.peek().map(|Reverse(key)| key.eta)
    }
}

/// A named, thread-safe task queue.
///
/// Ready tasks are delivered strictly by (priority desc, sequence asc);
/// delayed tasks become eligible once their eta elapses, promoted on every
/// dequeue attempt and on a time-driven check so idle queues still promote.
pub struct TaskQueue {
    name: String,
    config: TaskQueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl TaskQueue {
    /// Create a queue with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: TaskQueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Create a queue with default configuration
    pub fn with_default_config<S: Into<String>>(name: S) -> Self {
        Self::new(name, TaskQueueConfig::default())
    }

    /// The queue's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task; delayed if its eta is in the future, ready otherwise.
    pub async fn enqueue(&self, task: Task) -> TaskResult<TaskId> {
        let id = {
            let mut inner = self.inner.lock().await;
            if let Some(capacity) = self.config.capacity {
                if inner.queued >= capacity {
                    return Err(TaskError::QueueFull {
                        queue: self.name.clone(),
                        capacity,
                    });
                }
            }
            if inner.registry.contains_key(&task.id) {
                return Err(TaskError::invalid_task(format!(
                    "task {} already enqueued",
                    task.id
                )));
            }
            let id = task.id;
            inner.insert(task, Utc::now());
            id
        };
        debug!(task_id = %id, queue = %self.name, "enqueued task");
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Enqueue a batch; each item succeeds or fails independently so one bad
    /// task never blocks the rest.
    pub async fn enqueue_bulk(&self, tasks: Vec<Task>) -> Vec<TaskResult<TaskId>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.enqueue(task).await);
        }
        results
    }

    /// Block up to `timeout` for a ready task. Due delayed tasks are promoted
    /// first; returns the highest-priority, lowest-sequence ready task, or
    /// `None` once the timeout elapses.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Delivery> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before checking state, so an enqueue
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let next_eta = {
                let mut inner = self.inner.lock().await;
                inner.promote_due(Utc::now());
                if let Some(delivery) = inner.pop_ready() {
                    trace!(task_id = %delivery.task.id, queue = %self.name, "dequeued task");
                    return Some(delivery);
                }
                inner.next_eta()
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let mut sleep_for = deadline - now;
            if let Some(eta) = next_eta {
                let until_eta = (eta - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep_for = sleep_for
                    .min(until_eta)
                    .min(self.config.promotion_interval)
                    .max(Duration::from_millis(1));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Cancel a queued task before dispatch. Returns false for unknown ids;
    /// for a task already running, sets its cooperative cancel flag and
    /// returns false.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        let running_flag = match inner.registry.get(&id) {
            Some(slot) => match &slot.location {
                Location::Running(flag) => Some(flag.clone()),
                _ => None,
            },
            None => return false,
        };
        if let Some(flag) = running_flag {
            flag.store(true, AtomicOrdering::SeqCst);
            debug!(task_id = %id, "set cancel flag on running task");
            return false;
        }
        let removed = inner.remove_queued(id);
        if removed {
            debug!(task_id = %id, queue = %self.name, "cancelled queued task");
        }
        removed
    }

    /// Cancel every queued task carrying the tag; running tasks are left
    /// untouched. Idempotent: a second call cancels nothing.
    pub async fn cancel_by_tag(&self, tag: &str) -> usize {
        self.take_by_tag(tag).await.len()
    }

    /// Tag cancellation that reports the removed ids, for callers that also
    /// maintain result records.
    pub(crate) async fn take_by_tag(&self, tag: &str) -> Vec<TaskId> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<TaskId> = inner
            .tags
            .get(tag)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut cancelled = Vec::new();
        for id in ids {
            if inner.remove_queued(id) {
                cancelled.push(id);
            }
        }
        if !cancelled.is_empty() {
            debug!(tag, cancelled = cancelled.len(), queue = %self.name, "cancelled tasks by tag");
        }
        cancelled
    }

    /// Release the registry slot of a dispatched task once it has reached a
    /// recorded state.
    pub async fn ack(&self, id: TaskId) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.registry.remove(&id) {
            let task = slot.task;
            inner.strip_tags(&task);
        }
    }

    /// Re-register a retried task under its existing id with its new eta.
    /// Capacity is not enforced here: a retry must not be dropped.
    pub async fn requeue(&self, task: Task) {
        let id = task.id;
        {
            let mut inner = self.inner.lock().await;
            if let Some(slot) = inner.registry.remove(&id) {
                inner.strip_tags(&slot.task);
            }
            inner.insert(task, Utc::now());
        }
        debug!(task_id = %id, queue = %self.name, "requeued task for retry");
        self.notify.notify_waiters();
    }

    /// Look up a queued or running task by id
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner.registry.get(&id).map(|slot| slot.task.clone())
    }

    /// Point-in-time count of queued (ready + delayed) tasks; advisory only
    /// under concurrent mutation.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queued
    }

    /// Whether no tasks are queued
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The set of named queues in one engine instance. Queues are independent
/// and share no state beyond this map.
pub struct QueueSet {
    config: TaskQueueConfig,
    queues: RwLock<HashMap<String, Arc<TaskQueue>>>,
}

impl QueueSet {
    /// Create an empty set; queues are created on first use with `config`
    pub fn new(config: TaskQueueConfig) -> Self {
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Get the named queue, creating it if absent
    pub async fn get_or_create(&self, name: &str) -> Arc<TaskQueue> {
        if let Some(queue) = self.queues.read().await.get(name) {
            return queue.clone();
        }
        let mut queues = self.queues.write().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TaskQueue::new(name, self.config.clone())))
            .clone()
    }

    /// Get the named queue if it exists
    pub async fn get(&self, name: &str) -> Option<Arc<TaskQueue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Point-in-time queued counts per queue name
    pub async fn sizes(&self) -> HashMap<String, usize> {
        let queues = self.queues.read().await;
        let mut sizes = HashMap::with_capacity(queues.len());
        for (name, queue) in queues.iter() {
            sizes.insert(name.clone(), queue.len().await);
        }
        sizes
    }

    /// Cancel a task wherever it is queued
    pub async fn cancel(&self, id: TaskId) -> bool {
        let queues: Vec<Arc<TaskQueue>> = self.queues.read().await.values().cloned().collect();
        for queue in queues {
            if queue.cancel(id).await {
                return true;
            }
        }
        false
    }

    /// Cancel by tag across every queue
    pub async fn cancel_by_tag(&self, tag: &str) -> usize {
        self.take_by_tag(tag).await.len()
    }

    /// Tag cancellation across every queue, reporting the removed ids
    pub(crate) async fn take_by_tag(&self, tag: &str) -> Vec<TaskId> {
        let queues: Vec<Arc<TaskQueue>> = self.queues.read().await.values().cloned().collect();
        let mut cancelled = Vec::new();
        for queue in queues {
            cancelled.extend(queue.take_by_tag(tag).await);
        }
        cancelled
    }
}
