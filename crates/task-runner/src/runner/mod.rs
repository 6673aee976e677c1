//! Task acquisition and execution
//!
//! This module provides:
//! - [`TaskRunner`] - Ticks, polls and submits tasks for one worker
//! - [`TaskExecutor`] - Executes a task and reports its result with retry
//! - [`ExecutorPool`] - Fixed-size pool with graceful-then-forced drain
//! - [`DirectPoller`] - One batch poll per tick

mod direct;
mod executor;
mod pool;
mod task_runner;

pub use direct::DirectPoller;
pub use executor::TaskExecutor;
pub use pool::{ExecutorPool, FaultHook, PoolError, ShutdownOutcome};
pub use task_runner::{RunnerError, RunnerStatus, TaskRunner, TaskRunnerBuilder};
