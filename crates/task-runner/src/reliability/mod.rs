//! Reliability patterns for result reporting
//!
//! This module provides:
//! - [`RetryPolicy`] - Fixed-pause, bounded retry configuration
//! - [`Retrier`] - Runs an async operation under a policy

mod retry;

pub use retry::{Retrier, RetryError, RetryPolicy, Sleeper, TokioSleeper};
