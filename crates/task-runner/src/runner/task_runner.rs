//! Execution supervisor for one worker
//!
//! Ticks at the worker's polling interval. Each tick measures idle pool
//! capacity, asks the service for that many tasks and hands every task to
//! the pool. In streaming mode the pool is filled with poll-execute loops
//! instead and the tick only flushes the accumulated demand.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::direct::DirectPoller;
use super::executor::TaskExecutor;
use super::pool::{ExecutorPool, FaultHook, PoolError, ShutdownOutcome};
use crate::availability::{AvailabilityGate, InstanceStatus};
use crate::client::TaskService;
use crate::config::{ConfigError, PollStrategy, RunnerConfig, WorkerProperties};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::reliability::{Retrier, Sleeper};
use crate::streaming::PooledPoller;
use crate::task::Task;
use crate::worker::{Worker, WorkerError};

/// Shortest tick interval
const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(1);

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("more than one worker registered for task type: {0}")]
    DuplicateWorker(String),

    #[error("no workers registered")]
    NoWorkers,

    #[error("runner for {0} is already running")]
    AlreadyRunning(String),

    #[error("runner for {0} has been shut down")]
    ShutDown(String),

    #[error("executor pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Runner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    /// Built, not yet started
    Idle,
    /// Ticking
    Running,
    /// Draining in-flight executions
    Stopping,
    /// Shut down; cannot be restarted
    Stopped,
}

/// Builds a [`TaskRunner`]
pub struct TaskRunnerBuilder {
    worker: Arc<dyn Worker>,
    service: Arc<dyn TaskService>,
    config: RunnerConfig,
    properties: WorkerProperties,
    gate: Option<Arc<dyn AvailabilityGate>>,
    metrics: Arc<dyn MetricsSink>,
    fault_hook: Option<FaultHook>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl TaskRunnerBuilder {
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn properties(mut self, properties: WorkerProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Only poll while the gate reports the instance up
    pub fn gate(mut self, gate: Arc<dyn AvailabilityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Called when an execution unit or the tick loop dies from a panic
    pub fn fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    /// Replace the pause used between report retries
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> Result<Arc<TaskRunner>, RunnerError> {
        self.config.validate()?;

        let task_type = self.worker.task_type().to_string();
        let pool_size = self.config.thread_count_for(&task_type);

        let mut pool = ExecutorPool::new(self.config.worker_name_prefix.clone(), pool_size)
            .with_metrics(Arc::clone(&self.metrics));
        if let Some(hook) = self.fault_hook {
            pool = pool.with_fault_hook(hook);
        }

        let mut retrier = Retrier::new(self.config.retry_policy());
        if let Some(sleeper) = self.sleeper {
            retrier = retrier.with_sleeper(sleeper);
        }
        let executor = TaskExecutor::new(
            Arc::clone(&self.service),
            retrier,
            Arc::clone(&self.metrics),
        );

        let worker_id = self.worker.identity();
        let streaming = match self.config.strategy {
            PollStrategy::Direct => None,
            PollStrategy::Streaming => Some(Arc::new(
                PooledPoller::new(
                    Arc::clone(&self.service),
                    task_type.clone(),
                    worker_id.clone(),
                    pool_size,
                )
                .with_poll_timeout(self.config.poll_timeout)
                .with_metrics(Arc::clone(&self.metrics)),
            )),
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(TaskRunner {
            poller: DirectPoller::new(self.service, self.config.poll_timeout),
            worker: self.worker,
            worker_id,
            task_type,
            properties: self.properties,
            task_to_domain: self.config.task_to_domain,
            gate: self.gate,
            metrics: self.metrics,
            pool: Arc::new(pool),
            executor: Arc::new(executor),
            streaming,
            shutdown_grace_period: self.config.shutdown_grace_period,
            shutdown_tx,
            tick_handle: Mutex::new(None),
            status: RwLock::new(RunnerStatus::Idle),
        }))
    }
}

/// Polls for and executes the tasks of one worker
///
/// # Example
///
/// ```ignore
/// let runner = TaskRunner::builder(worker, service)
///     .config(RunnerConfig::new().with_thread_count(4))
///     .build()?;
///
/// runner.start()?;
/// // ...
/// runner.shutdown(Duration::from_secs(10)).await;
/// ```
pub struct TaskRunner {
    worker: Arc<dyn Worker>,
    worker_id: String,
    task_type: String,
    properties: WorkerProperties,
    task_to_domain: HashMap<String, String>,
    gate: Option<Arc<dyn AvailabilityGate>>,
    metrics: Arc<dyn MetricsSink>,
    pool: Arc<ExecutorPool>,
    executor: Arc<TaskExecutor>,
    poller: DirectPoller,
    streaming: Option<Arc<PooledPoller>>,
    shutdown_grace_period: Duration,
    shutdown_tx: watch::Sender<bool>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    status: RwLock<RunnerStatus>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("task_type", &self.task_type)
            .field("worker_id", &self.worker_id)
            .field("pool", &self.pool)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    pub fn builder(worker: Arc<dyn Worker>, service: Arc<dyn TaskService>) -> TaskRunnerBuilder {
        TaskRunnerBuilder {
            worker,
            service,
            config: RunnerConfig::default(),
            properties: WorkerProperties::default(),
            gate: None,
            metrics: Arc::new(NoopMetrics),
            fault_hook: None,
            sleeper: None,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.read()
    }

    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    /// Streaming adapter, when the streaming strategy is configured
    pub fn streaming(&self) -> Option<&Arc<PooledPoller>> {
        self.streaming.as_ref()
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        self.shutdown_grace_period
    }

    /// Start ticking
    #[instrument(skip(self), fields(task_type = %self.task_type))]
    pub fn start(self: &Arc<Self>) -> Result<(), RunnerError> {
        {
            let mut status = self.status.write();
            match *status {
                RunnerStatus::Idle => *status = RunnerStatus::Running,
                RunnerStatus::Running => {
                    return Err(RunnerError::AlreadyRunning(self.task_type.clone()))
                }
                RunnerStatus::Stopping | RunnerStatus::Stopped => {
                    return Err(RunnerError::ShutDown(self.task_type.clone()))
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            pool_size = self.pool.size(),
            polling_interval_ms = self.worker.polling_interval().as_millis() as u64,
            streaming = self.streaming.is_some(),
            "Starting task runner"
        );

        if let Some(poller) = &self.streaming {
            self.start_streaming_loops(poller)?;
        }
        self.start_tick_loop();
        Ok(())
    }

    /// Stop ticking and drain in-flight executions for up to `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.shutdown_with(timeout, std::future::pending()).await
    }

    /// Like [`shutdown`](Self::shutdown), cancelling immediately once
    /// `interrupt` resolves
    #[instrument(skip(self, interrupt), fields(task_type = %self.task_type))]
    pub async fn shutdown_with<I>(&self, timeout: Duration, interrupt: I) -> ShutdownOutcome
    where
        I: Future<Output = ()>,
    {
        *self.status.write() = RunnerStatus::Stopping;
        info!("Shutting down task runner");

        let _ = self.shutdown_tx.send(true);
        let handle = self.tick_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Some(poller) = &self.streaming {
            poller.stop();
        }

        let outcome = self.pool.drain(timeout, interrupt).await;
        *self.status.write() = RunnerStatus::Stopped;

        info!(?outcome, "Task runner stopped");
        outcome
    }

    /// Run one tick
    ///
    /// Returns the number of tasks submitted, or requested in streaming mode.
    pub async fn poll_and_execute(&self) -> usize {
        if !self.polling_permitted() {
            return 0;
        }

        let domain = self.resolve_domain();

        if let Some(poller) = &self.streaming {
            return poller.flush(domain).unwrap_or(0);
        }

        let idle = self.pool.idle_capacity();
        if idle < 1 {
            debug!(task_type = %self.task_type, "No idle capacity, skipping poll");
            return 0;
        }

        let started = Instant::now();
        let tasks = match self
            .poller
            .poll(&self.task_type, &self.worker_id, domain, idle)
            .await
        {
            Ok(tasks) => {
                self.metrics
                    .poll_completed(&self.task_type, started.elapsed(), tasks.len());
                tasks
            }
            Err(e) => {
                warn!(task_type = %self.task_type, error = %e, "Poll failed");
                self.metrics.poll_error(&self.task_type, &e.to_string());
                return 0;
            }
        };

        let mut submitted = 0;
        for task in tasks {
            if !task.has_id() {
                debug!(task_type = %self.task_type, "Dropping task without id");
                continue;
            }
            if self.submit(task).await {
                submitted += 1;
            }
        }
        submitted
    }

    /// Whether this tick may poll
    pub fn polling_permitted(&self) -> bool {
        if self.worker.paused() {
            debug!(task_type = %self.task_type, "Worker paused, skipping poll");
            self.metrics.task_paused(&self.task_type);
            return false;
        }

        if let Some(gate) = &self.gate {
            let status = gate.instance_status();
            if status != InstanceStatus::Up && !self.properties.discovery_override(&self.task_type)
            {
                debug!(
                    task_type = %self.task_type,
                    %status,
                    "Instance not up in discovery, skipping poll"
                );
                return false;
            }
        }

        true
    }

    /// Domain this runner polls
    pub fn resolve_domain(&self) -> Option<String> {
        self.properties
            .resolve_domain(&self.task_type, &self.task_to_domain)
    }

    /// Hand a task to the pool; a rejected task is reported FAILED inline
    async fn submit(&self, task: Task) -> bool {
        let executor = Arc::clone(&self.executor);
        let worker = Arc::clone(&self.worker);
        let fallback = task.clone();

        match self.pool.submit_cooperative(move |cancel| async move {
            executor.process_task_until(worker.as_ref(), task, &cancel).await;
        }) {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %fallback.task_id, error = %e, "Executor pool rejected task");
                let reason = format!("Task rejected by executor pool: {e}");
                self.executor
                    .fail_task(self.worker.as_ref(), fallback, &reason)
                    .await;
                false
            }
        }
    }

    fn start_streaming_loops(&self, poller: &Arc<PooledPoller>) -> Result<(), RunnerError> {
        for _ in 0..self.pool.size() {
            let poller = Arc::clone(poller);
            let executor = Arc::clone(&self.executor);
            let worker = Arc::clone(&self.worker);

            self.pool.submit_cooperative(move |cancel| async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        next = poller.next_task() => next,
                    };
                    match next {
                        Some(task) => {
                            executor.process_task_until(worker.as_ref(), task, &cancel).await;
                        }
                        None if poller.is_stopped() || cancel.is_cancelled() => break,
                        None => {}
                    }
                }
                debug!("Streaming loop exited");
            })?;
        }
        Ok(())
    }

    fn start_tick_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.worker.polling_interval().max(MIN_POLLING_INTERVAL);

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let tick = AssertUnwindSafe(this.poll_and_execute())
                    .catch_unwind()
                    .await;
                if let Err(payload) = tick {
                    let message = WorkerError::from_panic(payload).message;
                    error!(
                        task_type = %this.task_type,
                        error = %message,
                        "Uncaught fault in poll loop, stopping"
                    );
                    this.pool.report_fault(&this.task_type, &message);
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            debug!(task_type = %this.task_type, "Poll loop exited");
        });

        *self.tick_handle.lock() = Some(handle);
    }
}
