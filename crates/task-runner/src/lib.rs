//! # Task Runner
//!
//! Polls a remote task service for work, executes it on bounded worker pools
//! and reports the results back.
//!
//! ## Features
//!
//! - **Bounded execution**: one fixed-size pool per task type, polled for exactly its idle capacity
//! - **Two acquisition strategies**: direct batch polls, or streamed batch polls accumulated across waiting pool slots
//! - **Reliable reporting**: large outputs are externalized, updates are retried with a fixed pause
//! - **Fault containment**: worker errors and panics become FAILED results; loop faults reach a hook
//! - **Graceful shutdown**: drain in-flight work, then cancel what is left
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TaskRunnerConfigurer                       │
//! │  (one TaskRunner per worker, shared config and shutdown)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskRunner                             │
//! │  (ticks, DirectPoller or PooledPoller, ExecutorPool)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TaskExecutor                            │
//! │  (executes the worker, uploads output, reports with retry)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use task_runner::prelude::*;
//!
//! let service = Arc::new(InMemoryTaskService::new());
//! let worker = FnWorker::new("resize_image", |task| async move {
//!     Ok(TaskResult::complete(&task).with_output("resized", true))
//! });
//!
//! let configurer = TaskRunnerConfigurer::new(service, vec![Arc::new(worker)])
//!     .with_config(RunnerConfig::new().with_thread_count(4));
//! configurer.init()?;
//!
//! // ... later, graceful shutdown
//! configurer.shutdown().await;
//! ```

pub mod availability;
pub mod client;
pub mod config;
pub mod configurer;
pub mod metrics;
pub mod reliability;
pub mod runner;
pub mod streaming;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::availability::{AvailabilityGate, InstanceStatus, ManualGate};
    pub use crate::client::{InMemoryTaskService, PollRequest, ServiceError, TaskService};
    pub use crate::config::{PollStrategy, RunnerConfig, WorkerProperties};
    pub use crate::configurer::TaskRunnerConfigurer;
    pub use crate::metrics::{CountingMetrics, MetricsSink, NoopMetrics};
    pub use crate::reliability::{Retrier, RetryPolicy};
    pub use crate::runner::{RunnerError, ShutdownOutcome, TaskRunner};
    pub use crate::task::{Task, TaskResult, TaskResultStatus, TaskStatus};
    pub use crate::worker::{FnWorker, Worker, WorkerError};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use client::{InMemoryTaskService, PollRequest, ServiceError, TaskService, TaskStream};
pub use config::{ConfigError, PollStrategy, RunnerConfig, WorkerProperties};
pub use configurer::TaskRunnerConfigurer;
pub use metrics::{CountingMetrics, MetricsSink, NoopMetrics};
pub use reliability::{Retrier, RetryError, RetryPolicy};
pub use runner::{
    ExecutorPool, PoolError, RunnerError, RunnerStatus, ShutdownOutcome, TaskExecutor, TaskRunner,
};
pub use streaming::{Delivery, PooledPoller};
pub use task::{Task, TaskExecLog, TaskResult, TaskResultStatus, TaskStatus};
pub use worker::{FnWorker, Worker, WorkerError};
