//! Task service boundary
//!
//! This module provides:
//! - [`TaskService`] - Trait for the remote task queue (poll, stream, report)
//! - [`InMemoryTaskService`] - In-process implementation for tests and demos

mod memory;
mod service;

pub use memory::InMemoryTaskService;
pub use service::{PollRequest, ServiceError, TaskService, TaskStream};
