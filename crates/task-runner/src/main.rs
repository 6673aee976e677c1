use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use task_runner::telemetry::{init_telemetry, TelemetryConfig};
use task_runner::{
    FnWorker, InMemoryTaskService, RunnerConfig, Task, TaskResult, TaskRunnerConfigurer, Worker,
    WorkerProperties,
};
use uuid::Uuid;

const DEMO_TASK_TYPE: &str = "echo";
const DEMO_TASKS: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "task_runner=info")
    // - TASK_RUNNER_*: Runner configuration, see RunnerConfig::from_env
    // - CONDUCTOR_WORKER_<TYPE>__<PROPERTY>: Per-worker overrides
    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("task-runner starting...");

    let config = RunnerConfig::from_env().context("Invalid runner configuration")?;
    let properties = WorkerProperties::from_env();

    tracing::info!(
        thread_count = config.thread_count,
        strategy = ?config.strategy,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        "Loaded configuration"
    );

    // Seed an in-process queue so the binary runs without a remote service
    let service = Arc::new(InMemoryTaskService::new());
    let workflow_id = Uuid::now_v7().to_string();
    for i in 0..DEMO_TASKS {
        service.enqueue(
            Task::new(Uuid::now_v7().to_string(), DEMO_TASK_TYPE, &workflow_id)
                .with_input("sequence", i),
        );
    }

    let worker = FnWorker::new(DEMO_TASK_TYPE, |task| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(TaskResult::complete(&task).with_output("echo", task.input_data.clone()))
    });

    let workers: Vec<Arc<dyn Worker>> = vec![Arc::new(worker)];
    let configurer = TaskRunnerConfigurer::new(service.clone(), workers)
        .with_config(config)
        .with_properties(properties);
    configurer.init().context("Failed to start task runners")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    for (task_type, outcome) in configurer.shutdown().await {
        tracing::info!(%task_type, ?outcome, "Runner stopped");
    }

    tracing::info!(
        reported = service.reported().len(),
        pending = service.pending_count(DEMO_TASK_TYPE),
        "Shutdown complete"
    );
    Ok(())
}
