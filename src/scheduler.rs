//! Scheduler: re-submits tasks on cron or fixed-interval cadences

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::client::TaskClient;
use crate::cron::CronExpr;
use crate::error::{TaskError, TaskResult};
use crate::task::{Priority, RetryPolicy, Task};

/// When an entry fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleSpec {
    /// Standard cron cadence
    Cron(CronExpr),
    /// Fixed interval between fires
    Every(Duration),
}

impl ScheduleSpec {
    /// First fire instant at or after `from`
    fn first_fire(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Cron(expr) => expr.next_from(from),
            ScheduleSpec::Every(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| from + d)
            }
        }
    }

    /// Fire instant strictly after a fire at `fired_at`
    fn fire_after(&self, fired_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Cron(expr) => expr.next_after(fired_at),
            ScheduleSpec::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .map(|d| fired_at + d),
        }
    }
}

/// Template the scheduler instantiates into a fresh task on every fire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub payload: Value,
    pub queue: String,
    pub priority: Priority,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub tags: Vec<String>,
}

impl TaskTemplate {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            queue: "default".to_string(),
            priority: Priority::default(),
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            tags: Vec::new(),
        }
    }

    /// Build a task from the template with a fresh id
    pub fn instantiate(&self) -> TaskResult<Task> {
        Task::builder(&self.name)
            .payload(self.payload.clone())
            .queue(&self.queue)
            .priority(self.priority)
            .timeout(self.timeout)
            .retry_policy(self.retry.clone())
            .tags(self.tags.clone())
            .build()
    }
}

/// A named, recurring definition producing new task instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub spec: ScheduleSpec,
    pub template: TaskTemplate,
    pub enabled: bool,
    /// Cached; recomputed after each fire and on re-enable
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
    pub fire_count: u64,
}

impl ScheduleEntry {
    fn new(name: String, spec: ScheduleSpec, template: TaskTemplate) -> Self {
        let next_fire = spec.first_fire(Utc::now());
        Self {
            name,
            spec,
            template,
            enabled: true,
            next_fire,
            last_fire: None,
            fire_count: 0,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && matches!(self.next_fire, Some(at) if at <= now)
    }
}

/// Background loop that wakes at the earliest cached next-fire instant,
/// enqueues a fresh task from the due entry's template and re-sleeps.
pub struct Scheduler {
    client: Arc<TaskClient>,
    entries: Arc<RwLock<HashMap<String, ScheduleEntry>>>,
    changed: Arc<Notify>,
    shutdown: Arc<RwLock<bool>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(client: Arc<TaskClient>) -> Self {
        Self {
            client,
            entries: Arc::new(RwLock::new(HashMap::new())),
            changed: Arc::new(Notify::new()),
            shutdown: Arc::new(RwLock::new(false)),
            runner: Mutex::new(None),
        }
    }

    /// Add (or replace) an entry; it is enabled and considered immediately
    pub async fn add<S: Into<String>>(
        &self,
        name: S,
        spec: ScheduleSpec,
        template: TaskTemplate,
    ) -> TaskResult<()> {
        let name = name.into();
        // the template must be instantiable, catch bad definitions up front
        template.instantiate()?;
        let entry = ScheduleEntry::new(name.clone(), spec, template);
        info!(entry = %name, next_fire = ?entry.next_fire, "added schedule entry");
        self.entries.write().await.insert(name, entry);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Delete an entry's definition
    pub async fn remove(&self, name: &str) -> TaskResult<()> {
        let removed = self.entries.write().await.remove(name).is_some();
        if !removed {
            return Err(TaskError::unknown_entry(name));
        }
        info!(entry = %name, "removed schedule entry");
        self.changed.notify_waiters();
        Ok(())
    }

    /// Re-enable an entry, recomputing next-fire from the current instant
    pub async fn enable(&self, name: &str) -> TaskResult<()> {
        {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| TaskError::unknown_entry(name))?;
            entry.enabled = true;
            entry.next_fire = entry.spec.first_fire(Utc::now());
            debug!(entry = %name, next_fire = ?entry.next_fire, "enabled schedule entry");
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Take an entry out of consideration without deleting its definition
    pub async fn disable(&self, name: &str) -> TaskResult<()> {
        {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| TaskError::unknown_entry(name))?;
            entry.enabled = false;
            debug!(entry = %name, "disabled schedule entry");
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Snapshot of all entries with their cached next-fire instants
    pub async fn list(&self) -> Vec<ScheduleEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Spawn the background loop
    pub async fn start(&self) {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return;
        }
        *runner = Some(tokio::spawn(Self::run_loop(
            self.client.clone(),
            self.entries.clone(),
            self.changed.clone(),
            self.shutdown.clone(),
        )));
        info!("scheduler started");
    }

    async fn run_loop(
        client: Arc<TaskClient>,
        entries: Arc<RwLock<HashMap<String, ScheduleEntry>>>,
        changed: Arc<Notify>,
        shutdown: Arc<RwLock<bool>>,
    ) {
        loop {
            if *shutdown.read().await {
                break;
            }
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // fire due entries under the entry lock, submit outside it so
            // the scheduler never holds two subsystem locks at once
            let now = Utc::now();
            let mut to_submit = Vec::new();
            let earliest = {
                let mut entries = entries.write().await;
                for entry in entries.values_mut() {
                    if !entry.is_due(now) {
                        continue;
                    }
                    match entry.template.instantiate() {
                        Ok(task) => to_submit.push((entry.name.clone(), task)),
                        Err(e) => {
                            error!(entry = %entry.name, error = %e, "failed to instantiate schedule entry");
                        }
                    }
                    entry.last_fire = Some(now);
                    entry.fire_count += 1;
                    entry.next_fire = entry.spec.fire_after(now);
                    if entry.next_fire.is_none() {
                        debug!(entry = %entry.name, "schedule entry has no further fire points");
                        entry.enabled = false;
                    }
                }
                entries
                    .values()
                    .filter(|e| e.enabled)
                    .filter_map(|e| e.next_fire)
                    .min()
            };

            for (entry_name, task) in to_submit {
                let task_id = task.id;
                match client.submit(task).await {
                    Ok(_) => {
                        debug!(entry = %entry_name, task_id = %task_id, "scheduled task submitted")
                    }
                    Err(e) => {
                        error!(entry = %entry_name, error = %e, "failed to submit scheduled task")
                    }
                }
            }

            let sleep_for = match earliest {
                Some(at) => (at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .max(Duration::from_millis(1)),
                // nothing scheduled; sleep until an entry change wakes us
                None => Duration::from_secs(3600),
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("scheduler stopped");
    }

    /// Stop the background loop
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        self.changed.notify_waiters();
        if let Some(handle) = self.runner.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                error!("scheduler loop did not stop within grace period");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::queue::{QueueSet, TaskQueueConfig};
    use chrono::Timelike;
    use serde_json::json;

    fn client() -> Arc<TaskClient> {
        let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
        let backend = Arc::new(InMemoryBackend::with_default_config());
        Arc::new(TaskClient::new(queues, backend))
    }

    #[tokio::test]
    async fn interval_entry_fires_repeatedly() {
        let client = client();
        let scheduler = Scheduler::new(client.clone());
        let template = TaskTemplate {
            payload: json!({"source": "beat"}),
            queue: "periodic".to_string(),
            ..TaskTemplate::new("tick")
        };
        scheduler
            .add("beat", ScheduleSpec::Every(Duration::from_millis(40)), template)
            .await
            .unwrap();
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(220)).await;
        scheduler.shutdown().await;

        let sizes = client.queues().sizes().await;
        assert!(sizes["periodic"] >= 2, "expected repeated fires, got {:?}", sizes);

        let entries = scheduler.list().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].fire_count >= 2);
        assert!(entries[0].last_fire.is_some());
    }

    #[tokio::test]
    async fn disabled_entry_does_not_fire() {
        let client = client();
        let scheduler = Scheduler::new(client.clone());
        scheduler
            .add(
                "quiet",
                ScheduleSpec::Every(Duration::from_millis(30)),
                TaskTemplate::new("tick"),
            )
            .await
            .unwrap();
        scheduler.disable("quiet").await.unwrap();
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.shutdown().await;

        let sizes = client.queues().sizes().await;
        assert_eq!(sizes.get("default").copied().unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn enable_recomputes_next_fire_from_now() {
        let client = client();
        let scheduler = Scheduler::new(client);
        scheduler
            .add(
                "daily",
                ScheduleSpec::Cron(CronExpr::parse("0 0 * * *").unwrap()),
                TaskTemplate::new("tick"),
            )
            .await
            .unwrap();
        scheduler.disable("daily").await.unwrap();
        scheduler.enable("daily").await.unwrap();

        let entries = scheduler.list().await;
        let next = entries[0].next_fire.unwrap();
        assert!(next > Utc::now());
        assert_eq!((next.hour(), next.minute(), next.second()), (0, 0, 0));
    }

    #[tokio::test]
    async fn unknown_entry_operations_fail() {
        let scheduler = Scheduler::new(client());
        assert!(matches!(
            scheduler.remove("ghost").await,
            Err(TaskError::UnknownEntry { .. })
        ));
        assert!(matches!(
            scheduler.enable("ghost").await,
            Err(TaskError::UnknownEntry { .. })
        ));
        assert!(matches!(
            scheduler.disable("ghost").await,
            Err(TaskError::UnknownEntry { .. })
        ));
    }

    #[tokio::test]
    async fn add_rejects_templates_that_cannot_instantiate() {
        let scheduler = Scheduler::new(client());
        let result = scheduler
            .add(
                "broken",
                ScheduleSpec::Every(Duration::from_secs(60)),
                TaskTemplate::new(""),
            )
            .await;
        assert!(matches!(result, Err(TaskError::InvalidTask { .. })));
    }
}
