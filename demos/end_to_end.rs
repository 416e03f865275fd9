//! End-to-end example
//!
//! This example demonstrates how to:
//! 1. Set up the queue set, result backend, client and worker pool
//! 2. Register handlers, including one that reports progress and retries
//! 3. Submit tasks and wait for their results
//!
//! Run: cargo run --example end_to_end

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskmill::{
    handler_fn, InMemoryBackend, Outcome, Priority, QueueSet, RetryPolicy, Task, TaskClient,
    TaskQueueConfig, WorkerConfig, WorkerPool,
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting end-to-end example");

    let queues = Arc::new(QueueSet::new(TaskQueueConfig::default()));
    let backend = Arc::new(InMemoryBackend::with_default_config());
    let client = TaskClient::new(queues.clone(), backend.clone());

    // Configure worker pool over two queues
    let worker_config = WorkerConfig {
        workers: 2,
        queues: vec!["math".to_string(), "text".to_string()],
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let pool = WorkerPool::new(worker_config, queues, backend);

    // A handler that adds two numbers and reports its progress
    pool.register_handler("add", handler_fn(|task: Task, ctx| async move {
        ctx.report_progress(50, "adding").await;
        let a = task.payload["a"].as_i64().unwrap_or(0);
        let b = task.payload["b"].as_i64().unwrap_or(0);
        ctx.report_progress(100, "done").await;
        Outcome::Success(json!(a + b))
    }))
    .await;

    // A handler that fails on its first attempt and succeeds on the retry
    pool.register_handler("shaky_upper", handler_fn(|task: Task, ctx| async move {
        if ctx.attempt() == 1 {
            return Outcome::Retry("warming up".to_string());
        }
        let text = task.payload["text"].as_str().unwrap_or_default();
        Outcome::Success(json!(text.to_uppercase()))
    }))
    .await;

    pool.start().await;

    info!("Submitting tasks...");
    let mut handles = Vec::new();
    for i in 0..5 {
        let task = Task::builder("add")
            .queue("math")
            .payload(json!({"a": i, "b": i * 2}))
            .build()?;
        handles.push(client.submit(task).await?);
    }

    let shaky = Task::builder("shaky_upper")
        .queue("text")
        .priority(Priority::HIGH)
        .payload(json!({"text": "hello taskmill"}))
        .retry_policy(RetryPolicy {
            max_retries: 2,
            base_delay_secs: 1,
            ..Default::default()
        })
        .build()?;
    handles.push(client.submit(shaky).await?);

    for handle in handles {
        let record = handle
            .wait(Duration::from_secs(30))
            .await?
            .expect("task did not finish in time");
        info!(task_id = %handle.id(), state = ?record.state, result = ?record.result, "task finished");
    }

    let stats = pool.stats().await;
    info!(?stats, "worker pool stats");

    pool.shutdown().await;
    Ok(())
}
