//! Batch poll adapter
//!
//! Turns one streamed batch-poll response into per-waiter poll results.
//! Waiters park a holder and wait; a flush asks the service for as many tasks
//! as there are waiters and feeds the stream into the holders oldest first.
//! When the stream ends early, the remaining waiters are released with
//! [`Delivery::NotFound`] so nobody waits forever.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::accumulator::{DemandAccumulator, Enqueue};
use super::holder::{slot, Delivery, Holder};
use crate::client::{PollRequest, TaskService, TaskStream};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::task::Task;

/// How long a delivery waits for a parked holder
pub const HOLDER_WAIT: Duration = Duration::from_secs(1);

/// Waits longer than this are logged
pub const SLOW_POLL_THRESHOLD: Duration = Duration::from_secs(9);

/// How a stream error is surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorClass {
    /// Expected during deploys and credential rotation
    Quiet,
    /// Normal stream teardown
    Benign,
    /// Needs an operator
    Operator,
}

impl StreamErrorClass {
    pub fn classify(code: tonic::Code) -> Self {
        match code {
            tonic::Code::Unavailable | tonic::Code::Unauthenticated => Self::Quiet,
            tonic::Code::Cancelled
            | tonic::Code::Aborted
            | tonic::Code::DataLoss
            | tonic::Code::DeadlineExceeded => Self::Benign,
            _ => Self::Operator,
        }
    }
}

/// Streaming poll adapter for one task type
pub struct PooledPoller {
    service: Arc<dyn TaskService>,
    task_type: String,
    worker_id: String,
    poll_timeout: Duration,
    demand: DemandAccumulator,
    holder_arrived: Notify,
    space_freed: Notify,
    streams: TaskTracker,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for PooledPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledPoller")
            .field("task_type", &self.task_type)
            .field("worker_id", &self.worker_id)
            .field("demand", &self.demand)
            .finish_non_exhaustive()
    }
}

impl PooledPoller {
    pub fn new(
        service: Arc<dyn TaskService>,
        task_type: impl Into<String>,
        worker_id: impl Into<String>,
        pool_size: usize,
    ) -> Self {
        Self::with_demand(
            service,
            task_type,
            worker_id,
            DemandAccumulator::new(pool_size),
        )
    }

    /// Create an adapter around an existing accumulator
    pub fn with_demand(
        service: Arc<dyn TaskService>,
        task_type: impl Into<String>,
        worker_id: impl Into<String>,
        demand: DemandAccumulator,
    ) -> Self {
        Self {
            service,
            task_type: task_type.into(),
            worker_id: worker_id.into(),
            poll_timeout: Duration::from_millis(100),
            demand,
            holder_arrived: Notify::new(),
            space_freed: Notify::new(),
            streams: TaskTracker::new(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn demand(&self) -> &DemandAccumulator {
        &self.demand
    }

    pub fn is_stopped(&self) -> bool {
        self.demand.is_stopped()
    }

    /// Issue a batch request for the accumulated demand
    ///
    /// Does nothing while a request is in flight or nobody is waiting.
    /// Returns the number of tasks requested.
    pub fn flush(self: &Arc<Self>, domain: Option<String>) -> Option<usize> {
        let count = self.demand.begin_request()?;

        debug!(
            task_type = %self.task_type,
            count,
            domain = ?domain,
            "Requesting task batch"
        );

        let request = PollRequest::new(&self.task_type, &self.worker_id, count)
            .with_domain(domain)
            .with_timeout(self.poll_timeout);
        let stream = self.service.batch_poll_stream(request);

        let this = Arc::clone(self);
        self.streams.spawn(async move { this.consume(stream).await });
        Some(count)
    }

    /// Wait for a demand permit, then for a task
    pub async fn next_task(&self) -> Option<Task> {
        self.demand.acquire().await;
        self.get_task().await
    }

    /// Park a holder and wait for its delivery
    ///
    /// The caller must already hold a demand permit.
    pub async fn get_task(&self) -> Option<Task> {
        let (mut holder, slot) = slot();

        loop {
            let freed = self.space_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            match self.demand.enqueue(holder) {
                Enqueue::Queued => break,
                Enqueue::Stopped(_) => {
                    self.demand.release();
                    return None;
                }
                Enqueue::Full(returned) => {
                    warn!(task_type = %self.task_type, "Holder queue full, waiting for space");
                    holder = returned;
                    freed.await;
                }
            }
        }
        self.holder_arrived.notify_waiters();

        let created = slot.created();
        let delivery = slot.wait().await;

        let waited = created.elapsed();
        if waited > SLOW_POLL_THRESHOLD {
            info!(
                task_type = %self.task_type,
                waited_ms = waited.as_millis() as u64,
                "Slow poll"
            );
        }

        match delivery {
            Some(delivery) => delivery.into_task(),
            None => {
                self.demand.release();
                None
            }
        }
    }

    /// Refuse new waiters and release the parked ones
    ///
    /// With a request in flight the parked waiters are released when its
    /// stream ends.
    pub fn stop(&self) {
        let swept = self.demand.stop();
        if !swept.is_empty() {
            debug!(task_type = %self.task_type, waiters = swept.len(), "Releasing parked waiters");
        }
        self.release_all(swept);
        self.space_freed.notify_waiters();
    }

    /// Wait for in-flight streams to finish
    pub async fn wait_streams(&self) {
        self.streams.close();
        self.streams.wait().await;
    }

    #[instrument(skip_all, fields(task_type = %self.task_type))]
    async fn consume(&self, mut stream: TaskStream) {
        let started = Instant::now();
        let mut received = 0;

        while let Some(item) = stream.next().await {
            match item {
                Ok(task) => {
                    received += 1;
                    self.on_next(task).await;
                }
                Err(status) => {
                    self.on_error(&status);
                    break;
                }
            }
        }

        self.metrics.poll_completed(&self.task_type, started.elapsed(), received);
        self.drain().await;
    }

    async fn on_next(&self, task: Task) {
        let delivery = if task.has_id() {
            Delivery::Found(task)
        } else {
            Delivery::NotFound
        };
        self.save_task(delivery).await;
        self.demand.record_delivery();
    }

    fn on_error(&self, status: &tonic::Status) {
        match StreamErrorClass::classify(status.code()) {
            StreamErrorClass::Quiet => {
                debug!(code = ?status.code(), message = %status.message(), "Batch poll stream unavailable");
            }
            StreamErrorClass::Benign => {}
            StreamErrorClass::Operator => {
                error!(code = ?status.code(), message = %status.message(), "Batch poll stream failed");
                self.metrics.poll_error(&self.task_type, status.message());
            }
        }
    }

    /// Pad the shortfall with empty deliveries and return to idle
    async fn drain(&self) {
        let shortfall = self.demand.take_shortfall();
        for _ in 0..shortfall {
            self.save_task(Delivery::NotFound).await;
        }

        let swept = self.demand.finish_request();
        self.release_all(swept);
    }

    /// Hand a delivery to the oldest parked holder
    ///
    /// Returns false if no holder showed up in time; the delivery is dropped
    /// and no permit is released.
    async fn save_task(&self, mut delivery: Delivery) -> bool {
        let deadline = Instant::now() + HOLDER_WAIT;

        loop {
            let arrived = self.holder_arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(holder) = self.demand.pop_holder() {
                self.space_freed.notify_waiters();
                self.demand.release();
                match holder.deliver(delivery) {
                    Ok(()) => return true,
                    Err(Delivery::NotFound) => return true,
                    // Waiter went away; offer the task to the next one
                    Err(returned) => {
                        delivery = returned;
                        continue;
                    }
                }
            }

            if timeout_at(deadline, arrived).await.is_err() {
                error!(
                    task_type = %self.task_type,
                    found = matches!(delivery, Delivery::Found(_)),
                    "No waiting holder for delivery"
                );
                return false;
            }
        }
    }

    fn release_all(&self, holders: Vec<Holder>) {
        for holder in holders {
            self.demand.release();
            let _ = holder.deliver(Delivery::NotFound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskService;

    fn poller(service: &Arc<InMemoryTaskService>, pool_size: usize) -> Arc<PooledPoller> {
        Arc::new(PooledPoller::new(
            service.clone(),
            "encode",
            "worker-1",
            pool_size,
        ))
    }

    #[test]
    fn test_classification() {
        use tonic::Code;

        assert_eq!(StreamErrorClass::classify(Code::Unavailable), StreamErrorClass::Quiet);
        assert_eq!(StreamErrorClass::classify(Code::Unauthenticated), StreamErrorClass::Quiet);
        for code in [Code::Cancelled, Code::Aborted, Code::DataLoss, Code::DeadlineExceeded] {
            assert_eq!(StreamErrorClass::classify(code), StreamErrorClass::Benign);
        }
        assert_eq!(StreamErrorClass::classify(Code::Internal), StreamErrorClass::Operator);
        assert_eq!(StreamErrorClass::classify(Code::PermissionDenied), StreamErrorClass::Operator);
    }

    #[tokio::test]
    async fn test_flush_without_waiters_is_noop() {
        let service = Arc::new(InMemoryTaskService::new());
        let poller = poller(&service, 2);

        assert_eq!(poller.flush(None), None);
        assert!(service.poll_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_waiter_receives_task() {
        let service = Arc::new(InMemoryTaskService::new());
        service.enqueue(Task::new("t-1", "encode", "wf-1"));
        let poller = poller(&service, 1);

        let waiter = tokio::spawn({
            let poller = poller.clone();
            async move { poller.next_task().await }
        });
        tokio::task::yield_now().await;

        assert_eq!(poller.flush(None), Some(1));
        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.task_id, "t-1");

        poller.wait_streams().await;
        assert_eq!(poller.demand().available(), 1);
        assert!(!poller.demand().is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_task_is_not_found() {
        let service = Arc::new(InMemoryTaskService::new());
        service.enqueue(Task::new("", "encode", "wf-1"));
        let poller = poller(&service, 1);

        let waiter = tokio::spawn({
            let poller = poller.clone();
            async move { poller.next_task().await }
        });
        tokio::task::yield_now().await;

        poller.flush(None);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_rejects_new_waiters() {
        let service = Arc::new(InMemoryTaskService::new());
        let poller = poller(&service, 2);
        poller.stop();

        assert_eq!(poller.next_task().await, None);
        assert_eq!(poller.demand().available(), 2);
        assert_eq!(poller.flush(None), None);
    }
}
