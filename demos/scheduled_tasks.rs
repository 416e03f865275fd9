//! Scheduled tasks example
//!
//! This example demonstrates how to:
//! 1. Register schedule entries with cron and fixed-interval specs
//! 2. Run the scheduler loop next to a worker pool
//! 3. Enable, disable and inspect entries at runtime
//!
//! Run: cargo run --example scheduled_tasks

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskmill::{
    handler_fn, InMemoryBackend, Outcome, QueueSet, Scheduler, ScheduleSpec, TaskClient,
    TaskQueueConfig, TaskTemplate, WorkerConfig, WorkerPool,
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting scheduled tasks example");

    let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
    let backend = Arc::new(InMemoryBackend::with_default_config());
    let client = Arc::new(TaskClient::new(queues.clone(), backend.clone()));

    let worker_config = WorkerConfig {
        workers: 2,
        queues: vec!["default".to_string()],
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let pool = WorkerPool::new(worker_config, queues, backend);

    pool.register_handler("heartbeat", handler_fn(|_task, ctx| async move {
        info!(attempt = ctx.attempt(), "heartbeat fired");
        Outcome::Success(json!({"alive": true}))
    }))
    .await;

    pool.register_handler("report", handler_fn(|task, _ctx| async move {
        info!(payload = %task.payload, "generating report");
        Outcome::Success(json!({"report": "ok"}))
    }))
    .await;

    pool.start().await;

    let scheduler = Scheduler::new(client);

    // Fires every two seconds
    scheduler
        .add(
            "heartbeat",
            ScheduleSpec::Every(Duration::from_secs(2)),
            TaskTemplate::new("heartbeat"),
        )
        .await?;

    // Fires at the top of every minute
    let mut report = TaskTemplate::new("report");
    report.payload = json!({"kind": "minutely"});
    scheduler
        .add(
            "minutely_report",
            ScheduleSpec::Cron("* * * * *".parse()?),
            report,
        )
        .await?;

    scheduler.start().await;

    info!("Scheduler running; letting entries fire for a while...");
    tokio::time::sleep(Duration::from_secs(7)).await;

    // Pause the heartbeat, keep the report entry going
    scheduler.disable("heartbeat").await?;
    info!("Disabled heartbeat entry");

    for entry in scheduler.list().await {
        info!(
            entry = %entry.name,
            enabled = entry.enabled,
            fired = entry.fire_count,
            next = ?entry.next_fire,
            "schedule entry"
        );
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    scheduler.shutdown().await;
    pool.shutdown().await;
    Ok(())
}
