//! Worker trait definition

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskResult};

/// Default interval between polls for a worker
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// Error raised by a worker while executing a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerError {
    /// Error message
    pub message: String,

    /// Additional error details
    pub details: Option<serde_json::Value>,

    /// Diagnostic trace (error chain or panic location)
    pub trace: Option<String>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            trace: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a diagnostic trace
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Build an error from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self::new(format!("worker panicked: {message}"))
            .with_trace(format!("panic: {message}"))
    }

    /// Text captured into the task result log
    pub fn diagnostic(&self) -> String {
        match &self.trace {
            Some(trace) => format!("{}\n{}", self.message, trace),
            None => self.message.clone(),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkerError {}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string()).with_trace(format!("{err:?}"))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid task payload: {err}"))
    }
}

/// A worker executes tasks of a single task type
///
/// # Example
///
/// ```ignore
/// use task_runner::prelude::*;
///
/// struct ResizeImage;
///
/// #[async_trait]
/// impl Worker for ResizeImage {
///     fn task_type(&self) -> &str {
///         "resize_image"
///     }
///
///     async fn execute(&self, task: &Task) -> Result<TaskResult, WorkerError> {
///         let url = task.input_data.get("url").cloned().unwrap_or_default();
///         Ok(TaskResult::complete(task).with_output("resized", url))
///     }
/// }
/// ```
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Task type this worker polls for
    fn task_type(&self) -> &str;

    /// Identity reported with every result
    fn identity(&self) -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    /// Interval between polling ticks
    fn polling_interval(&self) -> Duration {
        DEFAULT_POLLING_INTERVAL
    }

    /// Paused workers are skipped by the poll loop
    fn paused(&self) -> bool {
        false
    }

    /// Execute the task
    async fn execute(&self, task: &Task) -> Result<TaskResult, WorkerError>;

    /// Called once when the result of a task could not be reported
    fn on_report_failure(&self, _task: &Task) {}
}

/// Boxed future returned by closure workers
pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<TaskResult, WorkerError>> + Send>>;

type WorkerFn = Arc<dyn Fn(Task) -> WorkerFuture + Send + Sync>;

/// Worker backed by an async closure
///
/// # Example
///
/// ```ignore
/// let worker = FnWorker::new("echo", |task| async move {
///     Ok(TaskResult::complete(&task).with_output("echo", task.input_data.clone()))
/// });
/// ```
#[derive(Clone)]
pub struct FnWorker {
    task_type: String,
    identity: Option<String>,
    polling_interval: Duration,
    handler: WorkerFn,
}

impl FnWorker {
    pub fn new<F, Fut>(task_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskResult, WorkerError>> + Send + 'static,
    {
        let handler: WorkerFn = Arc::new(move |task| Box::pin(handler(task)));
        Self {
            task_type: task_type.into(),
            identity: None,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            handler,
        }
    }

    /// Set the worker identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

impl std::fmt::Debug for FnWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnWorker")
            .field("task_type", &self.task_type)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for FnWorker {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn identity(&self) -> String {
        match &self.identity {
            Some(identity) => identity.clone(),
            None => std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    async fn execute(&self, task: &Task) -> Result<TaskResult, WorkerError> {
        (self.handler)(task.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payloads() {
        let err = WorkerError::from_panic(Box::new("index out of bounds"));
        assert_eq!(err.message, "worker panicked: index out of bounds");
        assert!(err.trace.is_some());

        let err = WorkerError::from_panic(Box::new(String::from("bad state")));
        assert_eq!(err.message, "worker panicked: bad state");

        let err = WorkerError::from_panic(Box::new(42_u8));
        assert_eq!(err.message, "worker panicked: unknown panic payload");
    }

    #[test]
    fn test_anyhow_conversion_keeps_chain() {
        let source = anyhow::anyhow!("disk full").context("writing thumbnail");
        let err = WorkerError::from(source);

        assert_eq!(err.message, "writing thumbnail");
        assert!(err.diagnostic().contains("disk full"));
    }

    #[tokio::test]
    async fn test_fn_worker_executes_closure() {
        let worker = FnWorker::new("echo", |task: Task| async move {
            Ok(TaskResult::complete(&task).with_output("seen", task.task_id.clone()))
        })
        .with_identity("worker-a")
        .with_polling_interval(Duration::from_millis(10));

        assert_eq!(worker.task_type(), "echo");
        assert_eq!(worker.identity(), "worker-a");
        assert_eq!(worker.polling_interval(), Duration::from_millis(10));
        assert!(!worker.paused());

        let task = Task::new("t-1", "echo", "wf-1");
        let result = worker.execute(&task).await.unwrap();
        assert_eq!(
            result.output_data.unwrap().get("seen"),
            Some(&serde_json::json!("t-1"))
        );
    }
}
