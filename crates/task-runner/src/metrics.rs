//! Metrics sink injected into runners
//!
//! The runner reports what happened; where it goes (Prometheus, StatsD,
//! nowhere) is decided by the [`MetricsSink`] implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Receives runner events
///
/// All methods default to no-ops so sinks only implement what they export.
pub trait MetricsSink: Send + Sync {
    /// A poll tick was skipped because the worker is paused
    fn task_paused(&self, _task_type: &str) {}

    /// A poll call failed
    fn poll_error(&self, _task_type: &str, _error: &str) {}

    /// A poll call returned
    fn poll_completed(&self, _task_type: &str, _elapsed: Duration, _tasks: usize) {}

    /// A task finished executing, successfully or not
    fn execution_completed(&self, _task_type: &str, _elapsed: Duration) {}

    /// A task execution raised an error or panicked
    fn execution_error(&self, _task_type: &str, _error: &str) {}

    /// Reporting a task result exhausted its retries
    fn update_error(&self, _task_type: &str, _error: &str) {}

    /// An unrecoverable fault escaped a scheduling loop or execution unit
    fn uncaught_fault(&self) {}
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Per-task-type counters
#[derive(Debug, Default)]
struct TaskTypeCounters {
    paused: AtomicU64,
    poll_errors: AtomicU64,
    polls: AtomicU64,
    tasks_polled: AtomicU64,
    executions: AtomicU64,
    execution_micros: AtomicU64,
    execution_errors: AtomicU64,
    update_errors: AtomicU64,
}

/// Point-in-time copy of the counters for one task type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub paused: u64,
    pub poll_errors: u64,
    pub polls: u64,
    pub tasks_polled: u64,
    pub executions: u64,
    pub execution_errors: u64,
    pub update_errors: u64,
}

/// Sink that counts events in memory
///
/// Useful in tests and for exposing simple counters on a status endpoint.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counters: DashMap<String, TaskTypeCounters>,
    uncaught_faults: AtomicU64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, task_type: &str, f: impl FnOnce(&TaskTypeCounters)) {
        if let Some(counters) = self.counters.get(task_type) {
            f(counters.value());
            return;
        }
        let counters = self.counters.entry(task_type.to_string()).or_default();
        f(counters.value());
    }

    /// Counters for a task type
    pub fn snapshot(&self, task_type: &str) -> CounterSnapshot {
        self.counters
            .get(task_type)
            .map(|c| CounterSnapshot {
                paused: c.paused.load(Ordering::Relaxed),
                poll_errors: c.poll_errors.load(Ordering::Relaxed),
                polls: c.polls.load(Ordering::Relaxed),
                tasks_polled: c.tasks_polled.load(Ordering::Relaxed),
                executions: c.executions.load(Ordering::Relaxed),
                execution_errors: c.execution_errors.load(Ordering::Relaxed),
                update_errors: c.update_errors.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Mean execution time for a task type
    pub fn mean_execution_time(&self, task_type: &str) -> Duration {
        self.counters.get(task_type).map_or(Duration::ZERO, |c| {
            let count = c.executions.load(Ordering::Relaxed);
            if count == 0 {
                return Duration::ZERO;
            }
            Duration::from_micros(c.execution_micros.load(Ordering::Relaxed) / count)
        })
    }

    pub fn uncaught_faults(&self) -> u64 {
        self.uncaught_faults.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetrics {
    fn task_paused(&self, task_type: &str) {
        self.with_counters(task_type, |c| {
            c.paused.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn poll_error(&self, task_type: &str, _error: &str) {
        self.with_counters(task_type, |c| {
            c.poll_errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn poll_completed(&self, task_type: &str, _elapsed: Duration, tasks: usize) {
        self.with_counters(task_type, |c| {
            c.polls.fetch_add(1, Ordering::Relaxed);
            c.tasks_polled.fetch_add(tasks as u64, Ordering::Relaxed);
        });
    }

    fn execution_completed(&self, task_type: &str, elapsed: Duration) {
        self.with_counters(task_type, |c| {
            c.executions.fetch_add(1, Ordering::Relaxed);
            c.execution_micros
                .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        });
    }

    fn execution_error(&self, task_type: &str, _error: &str) {
        self.with_counters(task_type, |c| {
            c.execution_errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn update_error(&self, task_type: &str, _error: &str) {
        self.with_counters(task_type, |c| {
            c.update_errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn uncaught_fault(&self) {
        self.uncaught_faults.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_task_type() {
        let metrics = CountingMetrics::new();
        metrics.poll_completed("encode", Duration::from_millis(3), 2);
        metrics.poll_completed("encode", Duration::from_millis(3), 1);
        metrics.poll_error("decode", "timeout");

        let encode = metrics.snapshot("encode");
        assert_eq!(encode.polls, 2);
        assert_eq!(encode.tasks_polled, 3);
        assert_eq!(encode.poll_errors, 0);
        assert_eq!(metrics.snapshot("decode").poll_errors, 1);
        assert_eq!(metrics.snapshot("unknown"), CounterSnapshot::default());
    }

    #[test]
    fn test_mean_execution_time() {
        let metrics = CountingMetrics::new();
        assert_eq!(metrics.mean_execution_time("encode"), Duration::ZERO);

        metrics.execution_completed("encode", Duration::from_millis(10));
        metrics.execution_completed("encode", Duration::from_millis(30));
        assert_eq!(
            metrics.mean_execution_time("encode"),
            Duration::from_millis(20)
        );
    }
}
