//! Result backend: task state, results, progress, and blocking waits

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskState};

/// Task progress: percentage plus free-text message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

/// One record per task id, owned by the backend. Mutated by the worker pool
/// on state transitions; read (and waited on) by any number of callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Attempt the record reflects, 0 before the first execution
    pub attempt: u32,
    /// Result value, set on SUCCESS
    pub result: Option<Value>,
    /// Error description, set on FAILURE
    pub error: Option<String>,
    pub progress: Option<Progress>,
    /// Opaque checkpoint payload written by the handler
    pub checkpoint: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl ResultRecord {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            attempt: 0,
            result: None,
            error: None,
            progress: None,
            checkpoint: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the record has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Storage for task state, results and progress.
///
/// Execution-time failures are recorded here and never thrown across the
/// worker/caller boundary; callers discover them by reading terminal states.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Create a PENDING record for a freshly submitted task. Returns false
    /// if a record for the id already existed.
    async fn init(&self, task_id: TaskId) -> bool;

    /// Record a state transition; terminal transitions wake all waiters
    async fn store_state(&self, task_id: TaskId, state: TaskState);

    /// Record the start of an execution attempt
    async fn mark_running(&self, task_id: TaskId, attempt: u32);

    /// Record a successful result (terminal)
    async fn store_result(&self, task_id: TaskId, value: Value);

    /// Record a failure description (terminal)
    async fn store_error(&self, task_id: TaskId, error: String);

    /// Record progress; best-effort, clamped to 0-100
    async fn store_progress(&self, task_id: TaskId, percent: u8, message: String);

    /// Persist an opaque checkpoint payload
    async fn store_checkpoint(&self, task_id: TaskId, value: Value);

    /// Read back the last checkpoint, if any
    async fn checkpoint(&self, task_id: TaskId) -> Option<Value>;

    /// Non-blocking read of the current (possibly still pending) record
    async fn get(&self, task_id: TaskId) -> Option<ResultRecord>;

    /// Block until the record reaches a terminal state or the timeout
    /// elapses. `Ok(None)` means timed out, or the record was reclaimed by
    /// cleanup mid-wait; ids never registered are `NotFound`.
    async fn wait(&self, task_id: TaskId, timeout: Duration) -> TaskResult<Option<ResultRecord>>;

    /// Remove terminal records older than the window; returns the count.
    /// Records for tasks still PENDING or RUNNING are never removed.
    async fn cleanup(&self, older_than: Duration) -> usize;
}

/// Configuration for the in-memory backend
#[derive(Debug, Clone)]
pub struct InMemoryBackendConfig {
    /// Retention window applied by opportunistic cleanup
    pub retention: Duration,
    /// Writes between opportunistic cleanup sweeps; 0 disables them
    pub cleanup_every: usize,
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(86_400), // 24 hours
            cleanup_every: 256,
        }
    }
}

struct RecordSlot {
    record: ResultRecord,
    notify: Arc<Notify>,
}

impl RecordSlot {
    fn new(task_id: TaskId) -> Self {
        Self {
            record: ResultRecord::new(task_id),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// In-memory [`ResultBackend`]: a reader-favoring map of records plus a
/// per-id notification signalled once per terminal transition.
pub struct InMemoryBackend {
    config: InMemoryBackendConfig,
    records: RwLock<HashMap<TaskId, RecordSlot>>,
    writes: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new(config: InMemoryBackendConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(InMemoryBackendConfig::default())
    }

    /// Apply a mutation to the record, creating it if absent. Writes to a
    /// record already in a terminal state are dropped; waiters are signalled
    /// exactly once, on the transition into a terminal state.
    async fn update<F>(&self, task_id: TaskId, mutate: F)
    where
        F: FnOnce(&mut ResultRecord),
    {
        let terminal_notify = {
            let mut records = self.records.write().await;
            let slot = records
                .entry(task_id)
                .or_insert_with(|| RecordSlot::new(task_id));
            if slot.record.is_terminal() {
                trace!(task_id = %task_id, "dropping write to terminal record");
                None
            } else {
                mutate(&mut slot.record);
                slot.record.updated_at = Utc::now();
                slot.record.is_terminal().then(|| slot.notify.clone())
            }
        };
        if let Some(notify) = terminal_notify {
            notify.notify_waiters();
        }
        self.amortized_cleanup().await;
    }

    /// Opportunistic cleanup, run every `cleanup_every` writes
    async fn amortized_cleanup(&self) {
        if self.config.cleanup_every == 0 {
            return;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.config.cleanup_every == 0 {
            let removed = self.cleanup(self.config.retention).await;
            if removed > 0 {
                debug!(removed, "amortized result cleanup");
            }
        }
    }
}

#[async_trait]
impl ResultBackend for InMemoryBackend {
    async fn init(&self, task_id: TaskId) -> bool {
        let mut records = self.records.write().await;
        match records.entry(task_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(RecordSlot::new(task_id));
                true
            }
        }
    }

    async fn store_state(&self, task_id: TaskId, state: TaskState) {
        self.update(task_id, |record| record.state = state).await;
    }

    async fn mark_running(&self, task_id: TaskId, attempt: u32) {
        self.update(task_id, |record| {
            record.state = TaskState::Running;
            record.attempt = attempt;
        })
        .await;
    }

    async fn store_result(&self, task_id: TaskId, value: Value) {
        self.update(task_id, |record| {
            record.state = TaskState::Success;
            record.result = Some(value);
        })
        .await;
    }

    async fn store_error(&self, task_id: TaskId, error: String) {
        self.update(task_id, |record| {
            record.state = TaskState::Failure;
            record.error = Some(error);
        })
        .await;
    }

    async fn store_progress(&self, task_id: TaskId, percent: u8, message: String) {
        self.update(task_id, |record| {
            record.progress = Some(Progress {
                percent: percent.min(100),
                message,
            });
        })
        .await;
    }

    async fn store_checkpoint(&self, task_id: TaskId, value: Value) {
        self.update(task_id, |record| record.checkpoint = Some(value))
            .await;
    }

    async fn checkpoint(&self, task_id: TaskId) -> Option<Value> {
        let records = self.records.read().await;
        records.get(&task_id).and_then(|slot| slot.record.checkpoint.clone())
    }

    async fn get(&self, task_id: TaskId) -> Option<ResultRecord> {
        let records = self.records.read().await;
        records.get(&task_id).map(|slot| slot.record.clone())
    }

    async fn wait(&self, task_id: TaskId, timeout: Duration) -> TaskResult<Option<ResultRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = false;
        loop {
            let slot = {
                let records = self.records.read().await;
                records
                    .get(&task_id)
                    .map(|slot| (slot.record.clone(), slot.notify.clone()))
            };
            let (record, notify) = match slot {
                Some(found) => found,
                // a record observed earlier in this wait was reclaimed by
                // cleanup; the result is gone, report a timeout not an
                // unknown id
                None if seen => return Ok(None),
                None => return Err(TaskError::not_found(task_id)),
            };
            seen = true;
            if record.is_terminal() {
                return Ok(Some(record));
            }

            // Register for the terminal signal before re-checking, so a
            // transition landing between the check and the await still wakes
            // this waiter.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let records = self.records.read().await;
                if let Some(slot) = records.get(&task_id) {
                    if slot.record.is_terminal() {
                        return Ok(Some(slot.record.clone()));
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, &mut notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn cleanup(&self, older_than: Duration) -> usize {
        let window = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let cutoff = Utc::now() - window;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, slot| !slot.record.is_terminal() || slot.record.updated_at > cutoff);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "removed expired result records");
        }
        removed
    }
}
