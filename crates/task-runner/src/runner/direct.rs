//! Direct batched polling

use std::sync::Arc;
use std::time::Duration;

use crate::client::{PollRequest, ServiceError, TaskService};
use crate::task::Task;

/// One batch poll per call
#[derive(Clone)]
pub struct DirectPoller {
    service: Arc<dyn TaskService>,
    timeout: Duration,
}

impl DirectPoller {
    pub fn new(service: Arc<dyn TaskService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// Poll for up to `count` tasks
    pub async fn poll(
        &self,
        task_type: &str,
        worker_id: &str,
        domain: Option<String>,
        count: usize,
    ) -> Result<Vec<Task>, ServiceError> {
        if count < 1 {
            return Ok(vec![]);
        }

        let request = PollRequest::new(task_type, worker_id, count)
            .with_domain(domain)
            .with_timeout(self.timeout);
        self.service.batch_poll(request).await
    }
}
