//! In-memory implementation of TaskService for testing

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use super::service::{PollRequest, ServiceError, TaskService, TaskStream};
use crate::task::{Task, TaskResult, TaskStatus};

/// Internal queue and fault-injection state
#[derive(Default)]
struct ServiceState {
    queues: HashMap<String, VecDeque<Task>>,
    reports: Vec<TaskResult>,
    poll_requests: Vec<PollRequest>,
    update_attempts: u32,
    failing_polls: u32,
    failing_updates: u32,
    failing_uploads: u32,
    stream_failure: Option<(tonic::Code, String)>,
    external_storage_threshold: Option<usize>,
}

impl ServiceState {
    /// Remove up to `count` tasks matching the request's type and domain
    fn take_tasks(&mut self, request: &PollRequest) -> Vec<Task> {
        self.poll_requests.push(request.clone());

        let Some(queue) = self.queues.get_mut(&request.task_type) else {
            return vec![];
        };

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        while let Some(mut task) = queue.pop_front() {
            if taken.len() < request.count && task.domain == request.domain {
                task.status = TaskStatus::InProgress;
                task.poll_count += 1;
                taken.push(task);
            } else {
                remaining.push_back(task);
            }
        }
        *queue = remaining;
        taken
    }
}

/// In-memory implementation of TaskService
///
/// Keeps one FIFO queue per task type and records every reported result.
/// Failures can be injected for polls, updates, uploads and streams.
///
/// # Example
///
/// ```
/// use task_runner::{InMemoryTaskService, Task};
///
/// let service = InMemoryTaskService::new();
/// service.enqueue(Task::new("t-1", "encode", "wf-1"));
/// assert_eq!(service.pending_count("encode"), 1);
/// ```
pub struct InMemoryTaskService {
    state: Mutex<ServiceState>,
}

impl InMemoryTaskService {
    /// Create an empty service
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
        }
    }

    /// Queue a task for delivery
    pub fn enqueue(&self, task: Task) {
        self.state
            .lock()
            .queues
            .entry(task.task_type.clone())
            .or_default()
            .push_back(task);
    }

    /// Number of tasks of a type still waiting for delivery
    pub fn pending_count(&self, task_type: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(task_type)
            .map_or(0, VecDeque::len)
    }

    /// All successfully reported results, in report order
    pub fn reported(&self) -> Vec<TaskResult> {
        self.state.lock().reports.clone()
    }

    /// Reported results for one task
    pub fn reports_for(&self, task_id: &str) -> Vec<TaskResult> {
        self.state
            .lock()
            .reports
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Every poll request received, direct or streamed
    pub fn poll_requests(&self) -> Vec<PollRequest> {
        self.state.lock().poll_requests.clone()
    }

    /// Number of `update_task` calls, failed ones included
    pub fn update_attempts(&self) -> u32 {
        self.state.lock().update_attempts
    }

    /// Fail the next `n` direct polls with a transport error
    pub fn fail_next_polls(&self, n: u32) {
        self.state.lock().failing_polls = n;
    }

    /// Fail the next `n` result updates with an API error
    pub fn fail_next_updates(&self, n: u32) {
        self.state.lock().failing_updates = n;
    }

    /// Fail the next `n` payload uploads with a transport error
    pub fn fail_next_uploads(&self, n: u32) {
        self.state.lock().failing_uploads = n;
    }

    /// End every streamed poll with this status after the available tasks
    pub fn fail_streams_with(&self, code: tonic::Code, message: impl Into<String>) {
        self.state.lock().stream_failure = Some((code, message.into()));
    }

    /// Let streamed polls complete normally again
    pub fn clear_stream_failure(&self) {
        self.state.lock().stream_failure = None;
    }

    /// Externalize outputs larger than `bytes`
    pub fn with_external_storage_threshold(self, bytes: usize) -> Self {
        self.state.lock().external_storage_threshold = Some(bytes);
        self
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.lock() = ServiceState::default();
    }
}

impl Default for InMemoryTaskService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskService for InMemoryTaskService {
    async fn batch_poll(&self, request: PollRequest) -> Result<Vec<Task>, ServiceError> {
        let mut state = self.state.lock();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            state.poll_requests.push(request);
            return Err(ServiceError::Transport("connection refused".to_string()));
        }
        Ok(state.take_tasks(&request))
    }

    fn batch_poll_stream(&self, request: PollRequest) -> TaskStream {
        let (tasks, failure) = {
            let mut state = self.state.lock();
            (state.take_tasks(&request), state.stream_failure.clone())
        };

        let delivered = stream::iter(tasks.into_iter().map(Ok));
        match failure {
            Some((code, message)) => delivered
                .chain(stream::once(async move {
                    Err(tonic::Status::new(code, message))
                }))
                .boxed(),
            None => delivered.boxed(),
        }
    }

    async fn update_task(&self, result: &TaskResult) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        state.update_attempts += 1;
        if state.failing_updates > 0 {
            state.failing_updates -= 1;
            return Err(ServiceError::Api {
                code: 503,
                body: "service unavailable".to_string(),
            });
        }
        state.reports.push(result.clone());
        Ok(())
    }

    async fn upload_large_payload(
        &self,
        result: &TaskResult,
        task_type: &str,
    ) -> Result<Option<String>, ServiceError> {
        let mut state = self.state.lock();
        if state.failing_uploads > 0 {
            state.failing_uploads -= 1;
            return Err(ServiceError::Transport("upload timed out".to_string()));
        }

        match state.external_storage_threshold {
            Some(threshold) if result.output_size() > threshold => Ok(Some(format!(
                "external/{}/{}.json",
                task_type, result.task_id
            ))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task_type: &str, count: usize) -> PollRequest {
        PollRequest::new(task_type, "worker-1", count)
    }

    #[tokio::test]
    async fn test_poll_respects_count_and_order() {
        let service = InMemoryTaskService::new();
        for i in 0..5 {
            service.enqueue(Task::new(format!("t-{i}"), "encode", "wf-1"));
        }

        let tasks = service.batch_poll(request("encode", 3)).await.unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t-0", "t-1", "t-2"]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::InProgress));
        assert_eq!(service.pending_count("encode"), 2);
    }

    #[tokio::test]
    async fn test_poll_matches_domain() {
        let service = InMemoryTaskService::new();
        service.enqueue(Task::new("t-plain", "encode", "wf-1"));
        service.enqueue(Task::new("t-gpu", "encode", "wf-1").with_domain("gpu"));

        let gpu = service
            .batch_poll(request("encode", 10).with_domain(Some("gpu".to_string())))
            .await
            .unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].task_id, "t-gpu");

        let plain = service.batch_poll(request("encode", 10)).await.unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].task_id, "t-plain");
    }

    #[tokio::test]
    async fn test_injected_update_failures() {
        let service = InMemoryTaskService::new();
        let task = Task::new("t-1", "encode", "wf-1");
        service.fail_next_updates(1);

        assert!(service.update_task(&TaskResult::complete(&task)).await.is_err());
        assert!(service.update_task(&TaskResult::complete(&task)).await.is_ok());
        assert_eq!(service.update_attempts(), 2);
        assert_eq!(service.reports_for("t-1").len(), 1);
    }

    #[tokio::test]
    async fn test_stream_ends_with_injected_status() {
        let service = InMemoryTaskService::new();
        service.enqueue(Task::new("t-1", "encode", "wf-1"));
        service.fail_streams_with(tonic::Code::Unavailable, "going away");

        let items: Vec<_> = service.batch_poll_stream(request("encode", 3)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(
            items[1].as_ref().unwrap_err().code(),
            tonic::Code::Unavailable
        );
    }

    #[tokio::test]
    async fn test_large_outputs_are_externalized() {
        let service = InMemoryTaskService::new().with_external_storage_threshold(8);
        let task = Task::new("t-1", "encode", "wf-1");

        let small = TaskResult::complete(&task);
        assert_eq!(service.upload_large_payload(&small, "encode").await.unwrap(), None);

        let large = TaskResult::complete(&task).with_output("blob", "x".repeat(64));
        assert_eq!(
            service.upload_large_payload(&large, "encode").await.unwrap(),
            Some("external/encode/t-1.json".to_string())
        );
    }
}
