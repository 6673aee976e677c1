//! Bounded executor pool
//!
//! Fixed number of execution units. Submissions beyond capacity are rejected
//! rather than queued; the supervisor only submits what it measured as idle.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::metrics::{MetricsSink, NoopMetrics};
use crate::worker::WorkerError;

/// Called with the execution unit name and the fault message
pub type FaultHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Pool errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("executor pool is shut down")]
    Shutdown,

    #[error("executor pool is saturated ({0} units busy)")]
    Saturated(usize),
}

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every execution finished in time
    Graceful,
    /// The grace period ran out; remaining executions were cancelled
    Forced,
    /// The wait was interrupted; remaining executions were cancelled
    Interrupted,
}

/// Fixed-size executor pool
pub struct ExecutorPool {
    name_prefix: String,
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    fault_hook: Option<FaultHook>,
    metrics: Arc<dyn MetricsSink>,
    next_unit: AtomicUsize,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("name_prefix", &self.name_prefix)
            .field("size", &self.size)
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl ExecutorPool {
    /// Create a pool with `size` execution units (at least one)
    pub fn new(name_prefix: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name_prefix: name_prefix.into(),
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            fault_hook: None,
            metrics: Arc::new(NoopMetrics),
            next_unit: AtomicUsize::new(0),
        }
    }

    /// Set the uncaught fault hook
    pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Units currently executing
    pub fn active_count(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// Units free to take a submission
    pub fn idle_capacity(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Report an unrecoverable fault through metrics and the fault hook
    pub fn report_fault(&self, unit: &str, message: &str) {
        self.metrics.uncaught_fault();
        if let Some(hook) = &self.fault_hook {
            hook(unit, message);
        }
    }

    /// Run `fut` on a free execution unit
    ///
    /// `fut` is dropped when the pool is force-cancelled. A panic inside
    /// `fut` is caught, logged and reported as a fault.
    pub fn submit<F>(&self, fut: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_unit(|cancel| async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Execution unit cancelled");
                }
                _ = fut => {}
            }
        })
    }

    /// Run the future built by `make` on a free execution unit
    ///
    /// The future receives the pool's cancellation token and is never
    /// dropped by a forced drain; it must observe the token and finish on
    /// its own. The drain waits for it.
    pub fn submit_cooperative<M, F>(&self, make: M) -> Result<(), PoolError>
    where
        M: FnOnce(CancellationToken) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_unit(make)
    }

    fn spawn_unit<M, F>(&self, make: M) -> Result<(), PoolError>
    where
        M: FnOnce(CancellationToken) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }

        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => PoolError::Shutdown,
                TryAcquireError::NoPermits => PoolError::Saturated(self.size),
            })?;

        let unit = unit_name(
            &self.name_prefix,
            self.next_unit.fetch_add(1, Ordering::Relaxed) + 1,
        );
        let fut = make(self.cancel.clone());
        let metrics = Arc::clone(&self.metrics);
        let hook = self.fault_hook.clone();
        let span = info_span!("execution_unit", unit = %unit);

        self.tracker.spawn(
            async move {
                let _permit = permit;
                if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
                    let message = WorkerError::from_panic(payload).message;
                    error!(error = %message, "Uncaught fault in execution unit");
                    metrics.uncaught_fault();
                    if let Some(hook) = hook {
                        hook(&unit, &message);
                    }
                }
            }
            .instrument(span),
        );

        Ok(())
    }

    /// Stop accepting work and wait up to `timeout` for running work
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.drain(timeout, std::future::pending()).await
    }

    /// Stop accepting work and wait for running work
    ///
    /// Running work is cancelled once `timeout` elapses or `interrupt`
    /// resolves, whichever comes first.
    pub async fn drain<I>(&self, timeout: Duration, interrupt: I) -> ShutdownOutcome
    where
        I: Future<Output = ()>,
    {
        self.tracker.close();

        let outcome = tokio::select! {
            waited = tokio::time::timeout(timeout, self.tracker.wait()) => match waited {
                Ok(()) => ShutdownOutcome::Graceful,
                Err(_) => ShutdownOutcome::Forced,
            },
            _ = interrupt => ShutdownOutcome::Interrupted,
        };

        if outcome != ShutdownOutcome::Graceful {
            warn!(
                prefix = %self.name_prefix,
                remaining = self.active_count(),
                ?outcome,
                "Cancelling running executions"
            );
            self.cancel.cancel();
            self.tracker.wait().await;
        }

        info!(prefix = %self.name_prefix, ?outcome, "Executor pool drained");
        outcome
    }
}

/// Name of an execution unit; `%d` in the prefix is replaced by its number
fn unit_name(prefix: &str, number: usize) -> String {
    if prefix.contains("%d") {
        prefix.replace("%d", &number.to_string())
    } else {
        format!("{prefix}{number}")
    }
}
