//! Task execution and result reporting

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::client::TaskService;
use crate::metrics::MetricsSink;
use crate::reliability::{Retrier, RetryError};
use crate::task::{Task, TaskResult, TaskStatus};
use crate::worker::{Worker, WorkerError};

/// Error message of an execution abandoned by a forced drain
pub const CANCELLED_DURING_SHUTDOWN: &str = "cancelled during shutdown";

/// Executes tasks and reports their results
pub struct TaskExecutor {
    service: Arc<dyn TaskService>,
    retrier: Retrier,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("retrier", &self.retrier)
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    pub fn new(
        service: Arc<dyn TaskService>,
        retrier: Retrier,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            service,
            retrier,
            metrics,
        }
    }

    /// Execute a task and report the outcome
    ///
    /// Errors and panics from the worker become a FAILED result. Returns
    /// whether the result reached the service.
    pub async fn process_task(&self, worker: &dyn Worker, task: Task) -> bool {
        self.process_task_until(worker, task, &CancellationToken::new()).await
    }

    /// Like [`process_task`](Self::process_task), abandoning the execution
    /// once `cancel` fires
    ///
    /// Only the worker's `execute` is abandoned. The task is then reported
    /// FAILED; the report itself is never cancelled.
    #[instrument(skip_all, fields(task_id = %task.task_id, task_type = %task.task_type))]
    pub async fn process_task_until(
        &self,
        worker: &dyn Worker,
        mut task: Task,
        cancel: &CancellationToken,
    ) -> bool {
        if task.task_type.trim().is_empty() {
            warn!("Task has no type, skipping");
            return false;
        }

        debug!(poll_count = task.poll_count, "Executing task");
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Execution cancelled during shutdown");
                Err(WorkerError::new(CANCELLED_DURING_SHUTDOWN))
            }
            outcome = AssertUnwindSafe(worker.execute(&task)).catch_unwind() => match outcome {
                Ok(outcome) => outcome,
                Err(payload) => Err(WorkerError::from_panic(payload)),
            },
        };

        let result = match outcome {
            Ok(mut result) => {
                result.workflow_instance_id = task.workflow_instance_id.clone();
                result.task_id = task.task_id.clone();
                result.worker_id = worker.identity();
                result
            }
            Err(err) => self.failure_result(worker, &mut task, &err),
        };

        self.metrics
            .execution_completed(&task.task_type, started.elapsed());
        debug!(status = %result.status, "Task executed");

        self.update_task_result(worker, &task, result).await
    }

    /// Report a task as FAILED without executing it
    pub async fn fail_task(&self, worker: &dyn Worker, mut task: Task, reason: &str) -> bool {
        task.status = TaskStatus::Failed;
        let mut result = TaskResult::failed(&task, reason);
        result.worker_id = worker.identity();
        self.update_task_result(worker, &task, result).await
    }

    fn failure_result(&self, worker: &dyn Worker, task: &mut Task, err: &WorkerError) -> TaskResult {
        error!(error = %err, "Unable to execute task");
        self.metrics.execution_error(&task.task_type, &err.message);

        task.status = TaskStatus::Failed;
        let mut result =
            TaskResult::failed(task, format!("Error while executing the task: {err}"));
        result.worker_id = worker.identity();
        result.log(err.diagnostic());
        result
    }

    /// Upload large output and report the result, both with retry
    ///
    /// On exhaustion the worker's failure hook runs once; nothing propagates.
    pub async fn update_task_result(
        &self,
        worker: &dyn Worker,
        task: &Task,
        result: TaskResult,
    ) -> bool {
        match self.report(task, result).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    error = %e,
                    "Failed to update task result"
                );
                self.metrics.update_error(&task.task_type, &e.to_string());
                worker.on_report_failure(task);
                false
            }
        }
    }

    async fn report(&self, task: &Task, mut result: TaskResult) -> Result<(), RetryError> {
        let service = &self.service;
        let task_type = task.task_type.as_str();

        let path = {
            let pending = &result;
            self.retrier
                .run("evaluateAndUploadLargePayload", move || {
                    service.upload_large_payload(pending, task_type)
                })
                .await?
        };
        if let Some(path) = path {
            debug!(path = %path, "Output moved to external storage");
            result.external_output_payload_storage_path = Some(path);
            result.output_data = None;
        }

        let result = &result;
        self.retrier
            .run("updateTask", move || service.update_task(result))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskService;
    use crate::metrics::CountingMetrics;
    use crate::reliability::{RetryPolicy, Sleeper};
    use crate::task::TaskResultStatus;
    use crate::worker::FnWorker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct InstantSleeper;

    #[async_trait]
    impl Sleeper for InstantSleeper {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn executor(
        service: &Arc<InMemoryTaskService>,
        metrics: &Arc<CountingMetrics>,
    ) -> TaskExecutor {
        let retrier = Retrier::new(RetryPolicy::fixed(Duration::from_millis(500), 3))
            .with_sleeper(Arc::new(InstantSleeper));
        TaskExecutor::new(service.clone(), retrier, metrics.clone())
    }

    fn task() -> Task {
        Task::new("t-1", "encode", "wf-1")
    }

    #[tokio::test]
    async fn test_success_is_stamped_and_reported() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());
        let worker = FnWorker::new("encode", |task| async move {
            let mut result = TaskResult::complete(&task).with_output("ok", true);
            result.task_id = "wrong".to_string();
            Ok(result)
        })
        .with_identity("host-a");

        assert!(executor(&service, &metrics).process_task(&worker, task()).await);

        let reports = service.reports_for("t-1");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TaskResultStatus::Completed);
        assert_eq!(reports[0].worker_id, "host-a");
        assert_eq!(reports[0].workflow_instance_id, "wf-1");
        assert_eq!(metrics.snapshot("encode").executions, 1);
    }

    #[tokio::test]
    async fn test_error_becomes_failed_result() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());
        let worker = FnWorker::new("encode", |_task| async move {
            Err::<TaskResult, _>(WorkerError::new("disk full").with_trace("at encode()"))
        });

        executor(&service, &metrics).process_task(&worker, task()).await;

        let report = &service.reports_for("t-1")[0];
        assert_eq!(report.status, TaskResultStatus::Failed);
        assert_eq!(
            report.reason_for_incompletion.as_deref(),
            Some("Error while executing the task: disk full")
        );
        assert!(report.logs[0].log.contains("at encode()"));
        assert_eq!(metrics.snapshot("encode").execution_errors, 1);
        assert_eq!(metrics.snapshot("encode").executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_execution_is_still_reported() {
        let service = Arc::new(InMemoryTaskService::new());
        service.fail_next_updates(1);
        let metrics = Arc::new(CountingMetrics::new());
        let worker = FnWorker::new("encode", |task| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(TaskResult::complete(&task))
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let executor = executor(&service, &metrics);
        assert!(executor.process_task_until(&worker, task(), &cancel).await);

        let reports = service.reports_for("t-1");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TaskResultStatus::Failed);
        assert_eq!(
            reports[0].reason_for_incompletion.as_deref(),
            Some("Error while executing the task: cancelled during shutdown")
        );
        assert_eq!(service.update_attempts(), 2);
    }

    struct Panicking;

    #[async_trait]
    impl Worker for Panicking {
        fn task_type(&self) -> &str {
            "encode"
        }

        async fn execute(&self, _task: &Task) -> Result<TaskResult, WorkerError> {
            panic!("index out of bounds")
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_result() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());

        executor(&service, &metrics).process_task(&Panicking, task()).await;

        let reports = service.reports_for("t-1");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TaskResultStatus::Failed);
        assert!(reports[0]
            .reason_for_incompletion
            .as_deref()
            .unwrap()
            .contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_blank_task_type_is_skipped() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());
        let worker = FnWorker::new("encode", |task| async move { Ok(TaskResult::complete(&task)) });

        let reported = executor(&service, &metrics)
            .process_task(&worker, Task::new("t-1", " ", "wf-1"))
            .await;

        assert!(!reported);
        assert!(service.reported().is_empty());
        assert_eq!(service.update_attempts(), 0);
    }

    struct CountingFailures {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Worker for CountingFailures {
        fn task_type(&self) -> &str {
            "encode"
        }

        async fn execute(&self, task: &Task) -> Result<TaskResult, WorkerError> {
            Ok(TaskResult::complete(task))
        }

        fn on_report_failure(&self, _task: &Task) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_update_retries_then_gives_up() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());
        let worker = CountingFailures {
            failures: AtomicU32::new(0),
        };
        service.fail_next_updates(10);

        let reported = executor(&service, &metrics).process_task(&worker, task()).await;

        assert!(!reported);
        assert_eq!(service.update_attempts(), 3);
        assert_eq!(worker.failures.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot("encode").update_errors, 1);
    }

    #[tokio::test]
    async fn test_update_recovers_within_retries() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());
        let worker = CountingFailures {
            failures: AtomicU32::new(0),
        };
        service.fail_next_updates(2);

        assert!(executor(&service, &metrics).process_task(&worker, task()).await);
        assert_eq!(service.update_attempts(), 3);
        assert_eq!(service.reports_for("t-1").len(), 1);
        assert_eq!(worker.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_skips_update() {
        let service = Arc::new(InMemoryTaskService::new());
        let metrics = Arc::new(CountingMetrics::new());
        let worker = CountingFailures {
            failures: AtomicU32::new(0),
        };
        service.fail_next_uploads(3);

        executor(&service, &metrics).process_task(&worker, task()).await;

        assert_eq!(service.update_attempts(), 0);
        assert_eq!(worker.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_large_output_is_externalized() {
        let service = Arc::new(InMemoryTaskService::new().with_external_storage_threshold(16));
        let metrics = Arc::new(CountingMetrics::new());
        let worker = FnWorker::new("encode", |task| async move {
            Ok(TaskResult::complete(&task).with_output("frames", "x".repeat(128)))
        });

        executor(&service, &metrics).process_task(&worker, task()).await;

        let report = &service.reports_for("t-1")[0];
        assert_eq!(
            report.external_output_payload_storage_path.as_deref(),
            Some("external/encode/t-1.json")
        );
        assert_eq!(report.output_data, None);
    }
}
