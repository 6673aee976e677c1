//! Starts and stops one runner per registered worker

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{info, instrument};

use crate::availability::AvailabilityGate;
use crate::client::TaskService;
use crate::config::{RunnerConfig, WorkerProperties};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::reliability::Sleeper;
use crate::runner::{FaultHook, RunnerError, ShutdownOutcome, TaskRunner};
use crate::worker::Worker;

/// Owns the runners of a worker process
///
/// # Example
///
/// ```ignore
/// let configurer = TaskRunnerConfigurer::new(service, vec![Arc::new(worker)])
///     .with_config(RunnerConfig::from_env()?)
///     .with_properties(WorkerProperties::from_env());
///
/// configurer.init()?;
/// tokio::signal::ctrl_c().await?;
/// configurer.shutdown().await;
/// ```
pub struct TaskRunnerConfigurer {
    service: Arc<dyn TaskService>,
    workers: Vec<Arc<dyn Worker>>,
    config: RunnerConfig,
    properties: WorkerProperties,
    gate: Option<Arc<dyn AvailabilityGate>>,
    metrics: Arc<dyn MetricsSink>,
    fault_hook: Option<FaultHook>,
    sleeper: Option<Arc<dyn Sleeper>>,
    runners: DashMap<String, Arc<TaskRunner>>,
}

impl TaskRunnerConfigurer {
    pub fn new(service: Arc<dyn TaskService>, workers: Vec<Arc<dyn Worker>>) -> Self {
        Self {
            service,
            workers,
            config: RunnerConfig::default(),
            properties: WorkerProperties::default(),
            gate: None,
            metrics: Arc::new(NoopMetrics),
            fault_hook: None,
            sleeper: None,
            runners: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_properties(mut self, properties: WorkerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn AvailabilityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Build and start a runner for every worker
    ///
    /// Fails without starting anything if the workers or config are invalid.
    #[instrument(skip(self), fields(workers = self.workers.len()))]
    pub fn init(&self) -> Result<(), RunnerError> {
        if self.workers.is_empty() {
            return Err(RunnerError::NoWorkers);
        }
        self.config.validate()?;

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.task_type()) {
                return Err(RunnerError::DuplicateWorker(worker.task_type().to_string()));
            }
        }
        if let Some(running) = self.runners.iter().next() {
            return Err(RunnerError::AlreadyRunning(running.key().clone()));
        }

        let mut built = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let mut builder = TaskRunner::builder(Arc::clone(worker), Arc::clone(&self.service))
                .config(self.config.clone())
                .properties(self.properties.clone())
                .metrics(Arc::clone(&self.metrics));
            if let Some(gate) = &self.gate {
                builder = builder.gate(Arc::clone(gate));
            }
            if let Some(hook) = &self.fault_hook {
                builder = builder.fault_hook(Arc::clone(hook));
            }
            if let Some(sleeper) = &self.sleeper {
                builder = builder.sleeper(Arc::clone(sleeper));
            }
            built.push(builder.build()?);
        }

        for runner in built {
            runner.start()?;
            info!(
                task_type = %runner.task_type(),
                pool_size = runner.pool().size(),
                domain = ?runner.resolve_domain(),
                "Worker started"
            );
            self.runners.insert(runner.task_type().to_string(), runner);
        }

        Ok(())
    }

    /// Shut every runner down concurrently
    ///
    /// Each runner gets the configured grace period.
    pub async fn shutdown(&self) -> Vec<(String, ShutdownOutcome)> {
        let runners: Vec<Arc<TaskRunner>> =
            self.runners.iter().map(|r| Arc::clone(r.value())).collect();
        self.runners.clear();

        let grace = self.config.shutdown_grace_period;
        let outcomes = join_all(runners.iter().map(|runner| runner.shutdown(grace))).await;

        runners
            .iter()
            .map(|runner| runner.task_type().to_string())
            .zip(outcomes)
            .collect()
    }

    /// Runner for a task type
    pub fn runner(&self, task_type: &str) -> Option<Arc<TaskRunner>> {
        self.runners.get(task_type).map(|r| Arc::clone(r.value()))
    }

    pub fn task_types(&self) -> Vec<String> {
        self.runners.iter().map(|r| r.key().clone()).collect()
    }
}
