//! Streaming acquisition
//!
//! This module provides:
//! - [`PooledPoller`] - Converts streamed batch polls into per-waiter results
//! - [`DemandAccumulator`] - Counts waiting capacity, one request in flight
//! - [`Holder`] / [`Slot`] - One-shot delivery placeholder

mod accumulator;
mod holder;
mod pooled_poller;

pub use accumulator::{DemandAccumulator, Enqueue, HOLDER_QUEUE_CAPACITY};
pub use holder::{slot, Delivery, Holder, Slot};
pub use pooled_poller::{PooledPoller, StreamErrorClass, HOLDER_WAIT, SLOW_POLL_THRESHOLD};
