//! Demand accounting for streamed batch polls
//!
//! Every waiter takes one demand permit before parking a [`Holder`]. The
//! number of taken permits is the demand the next batch request asks for.
//! Whoever completes a holder gives its permit back.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::holder::Holder;

/// Maximum number of parked holders
pub const HOLDER_QUEUE_CAPACITY: usize = 10_000;

/// Result of parking a holder
#[derive(Debug)]
pub enum Enqueue {
    Queued,
    /// The adapter is stopped; the holder is handed back
    Stopped(Holder),
    /// The queue is full; the holder is handed back
    Full(Holder),
}

#[derive(Debug, Default)]
struct DemandState {
    in_flight: bool,
    expected: usize,
    stopped: bool,
    holders: VecDeque<Holder>,
}

/// Counts idle capacity and owns the holder queue
///
/// At most one batch request is in flight at a time. Starting a request,
/// parking a holder and stopping all take the same lock.
#[derive(Debug)]
pub struct DemandAccumulator {
    pool_size: usize,
    capacity: usize,
    permits: Arc<Semaphore>,
    state: Mutex<DemandState>,
}

impl DemandAccumulator {
    pub fn new(pool_size: usize) -> Self {
        Self::with_capacity(pool_size, HOLDER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(pool_size: usize, capacity: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            pool_size,
            capacity: capacity.max(1),
            permits: Arc::new(Semaphore::new(pool_size)),
            state: Mutex::new(DemandState::default()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Take one demand permit, waiting until one is free
    pub async fn acquire(&self) {
        // The semaphore is never closed.
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }

    /// Give one demand permit back
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Permits currently taken by waiters
    pub fn pending(&self) -> usize {
        self.pool_size.saturating_sub(self.available())
    }

    /// Start a batch request if idle and there is demand
    ///
    /// Returns the number of tasks to ask for.
    pub fn begin_request(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.stopped || state.in_flight {
            return None;
        }
        let pending = self.pending();
        if pending < 1 {
            return None;
        }
        state.in_flight = true;
        state.expected = pending;
        Some(pending)
    }

    /// Park a holder at the back of the queue
    pub fn enqueue(&self, holder: Holder) -> Enqueue {
        let mut state = self.state.lock();
        if state.stopped {
            return Enqueue::Stopped(holder);
        }
        if state.holders.len() >= self.capacity {
            return Enqueue::Full(holder);
        }
        state.holders.push_back(holder);
        Enqueue::Queued
    }

    /// Oldest parked holder
    pub fn pop_holder(&self) -> Option<Holder> {
        self.state.lock().holders.pop_front()
    }

    /// One streamed item was handled
    pub fn record_delivery(&self) {
        let mut state = self.state.lock();
        state.expected = state.expected.saturating_sub(1);
    }

    /// Items the current request still owes, resetting the count
    pub fn take_shortfall(&self) -> usize {
        std::mem::take(&mut self.state.lock().expected)
    }

    /// Mark the current request finished
    ///
    /// Once stopped, returns every parked holder so the caller can release it.
    pub fn finish_request(&self) -> Vec<Holder> {
        let mut state = self.state.lock();
        state.in_flight = false;
        state.expected = 0;
        if state.stopped {
            state.holders.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Refuse new holders
    ///
    /// Returns the parked holders when no request is in flight; otherwise they
    /// are returned by [`finish_request`](Self::finish_request).
    pub fn stop(&self) -> Vec<Holder> {
        let mut state = self.state.lock();
        state.stopped = true;
        if state.in_flight {
            Vec::new()
        } else {
            state.holders.drain(..).collect()
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Number of parked holders
    pub fn waiting(&self) -> usize {
        self.state.lock().holders.len()
    }

    pub fn expected(&self) -> usize {
        self.state.lock().expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::holder::{slot, Delivery};

    #[tokio::test]
    async fn test_no_request_without_demand() {
        let demand = DemandAccumulator::new(3);
        assert_eq!(demand.pending(), 0);
        assert_eq!(demand.begin_request(), None);
        assert!(!demand.is_in_flight());
    }

    #[tokio::test]
    async fn test_single_request_in_flight() {
        let demand = DemandAccumulator::new(3);
        demand.acquire().await;
        demand.acquire().await;

        assert_eq!(demand.begin_request(), Some(2));
        assert_eq!(demand.expected(), 2);

        demand.acquire().await;
        assert_eq!(demand.begin_request(), None);

        demand.finish_request();
        assert_eq!(demand.begin_request(), Some(3));
    }

    #[tokio::test]
    async fn test_shortfall_counts_down() {
        let demand = DemandAccumulator::new(4);
        for _ in 0..4 {
            demand.acquire().await;
        }
        demand.begin_request();
        demand.record_delivery();

        assert_eq!(demand.take_shortfall(), 3);
        assert_eq!(demand.take_shortfall(), 0);
    }

    #[tokio::test]
    async fn test_holders_are_fifo() {
        let demand = DemandAccumulator::new(2);
        let (first, first_slot) = slot();
        let (second, _second_slot) = slot();
        assert!(matches!(demand.enqueue(first), Enqueue::Queued));
        assert!(matches!(demand.enqueue(second), Enqueue::Queued));

        demand
            .pop_holder()
            .unwrap()
            .deliver(Delivery::NotFound)
            .unwrap();
        assert!(first_slot.wait().await.is_some());
        assert_eq!(demand.waiting(), 1);
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let demand = DemandAccumulator::with_capacity(1, 1);
        let (first, _a) = slot();
        let (second, _b) = slot();
        assert!(matches!(demand.enqueue(first), Enqueue::Queued));
        assert!(matches!(demand.enqueue(second), Enqueue::Full(_)));
    }

    #[tokio::test]
    async fn test_stop_while_idle_sweeps_holders() {
        let demand = DemandAccumulator::new(2);
        let (holder, _slot) = slot();
        demand.enqueue(holder);

        assert_eq!(demand.stop().len(), 1);
        assert!(demand.is_stopped());

        let (late, _late_slot) = slot();
        assert!(matches!(demand.enqueue(late), Enqueue::Stopped(_)));
    }

    #[tokio::test]
    async fn test_stop_while_in_flight_defers_sweep() {
        let demand = DemandAccumulator::new(2);
        demand.acquire().await;
        let (holder, _slot) = slot();
        demand.enqueue(holder);
        demand.begin_request();

        assert!(demand.stop().is_empty());
        assert_eq!(demand.finish_request().len(), 1);
        assert_eq!(demand.begin_request(), None);
    }
}
