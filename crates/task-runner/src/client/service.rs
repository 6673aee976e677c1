//! TaskService trait definition

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::task::{Task, TaskResult};

/// Error type for task service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service answered with an error response
    #[error("api error {code}: {body}")]
    Api { code: u16, body: String },

    /// The request never reached the service
    #[error("transport error: {0}")]
    Transport(String),

    /// gRPC status
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Stream of tasks answering one batch poll
///
/// The stream ends after at most `count` tasks, or with an error status.
pub type TaskStream = BoxStream<'static, Result<Task, tonic::Status>>;

/// Poll request for a task type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub task_type: String,
    pub worker_id: String,
    pub domain: Option<String>,
    /// Maximum number of tasks to return
    pub count: usize,
    /// How long the service may hold the call open waiting for tasks
    pub timeout: Duration,
}

impl PollRequest {
    pub fn new(task_type: impl Into<String>, worker_id: impl Into<String>, count: usize) -> Self {
        Self {
            task_type: task_type.into(),
            worker_id: worker_id.into(),
            domain: None,
            count,
            timeout: Duration::from_millis(100),
        }
    }

    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Remote task queue as seen by workers
///
/// Implementations wrap a transport (HTTP, gRPC, in-memory). Every call may
/// fail; the runner decides whether a failure is retried.
#[async_trait]
pub trait TaskService: Send + Sync + 'static {
    /// Poll for up to `request.count` tasks, waiting at most `request.timeout`
    async fn batch_poll(&self, request: PollRequest) -> Result<Vec<Task>, ServiceError>;

    /// Open a streamed batch poll
    ///
    /// Failures to open the stream surface as its first item.
    fn batch_poll_stream(&self, request: PollRequest) -> TaskStream;

    /// Report the result of a task
    async fn update_task(&self, result: &TaskResult) -> Result<(), ServiceError>;

    /// Move a large output payload to external storage
    ///
    /// Returns the storage reference when the payload was uploaded.
    async fn upload_large_payload(
        &self,
        _result: &TaskResult,
        _task_type: &str,
    ) -> Result<Option<String>, ServiceError> {
        Ok(None)
    }
}
