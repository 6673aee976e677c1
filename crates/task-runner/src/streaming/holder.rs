//! One-shot placeholder connecting a streamed delivery to a parked waiter

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::task::Task;

/// What a waiter receives
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A task to execute
    Found(Task),

    /// The batch ended without a task for this waiter
    NotFound,
}

impl Delivery {
    pub fn into_task(self) -> Option<Task> {
        match self {
            Self::Found(task) => Some(task),
            Self::NotFound => None,
        }
    }
}

/// Write side of a slot, owned by the adapter
#[derive(Debug)]
pub struct Holder {
    tx: oneshot::Sender<Delivery>,
}

impl Holder {
    /// Complete the slot
    ///
    /// Hands the delivery back if the waiter has gone away.
    pub fn deliver(self, delivery: Delivery) -> Result<(), Delivery> {
        self.tx.send(delivery)
    }

    /// Whether the waiter is still listening
    pub fn is_waiting(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Read side of a slot, owned by the waiter
#[derive(Debug)]
pub struct Slot {
    rx: oneshot::Receiver<Delivery>,
    created: Instant,
}

impl Slot {
    /// Wait for the delivery
    ///
    /// `None` means the holder was dropped without delivering.
    pub async fn wait(self) -> Option<Delivery> {
        self.rx.await.ok()
    }

    pub fn created(&self) -> Instant {
        self.created
    }
}

/// Create a connected holder and slot
pub fn slot() -> (Holder, Slot) {
    let (tx, rx) = oneshot::channel();
    (
        Holder { tx },
        Slot {
            rx,
            created: Instant::now(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_reaches_slot() {
        let (holder, slot) = slot();
        holder
            .deliver(Delivery::Found(Task::new("t-1", "encode", "wf-1")))
            .unwrap();

        let task = slot.wait().await.and_then(Delivery::into_task).unwrap();
        assert_eq!(task.task_id, "t-1");
    }

    #[tokio::test]
    async fn test_dropped_holder_resolves_slot() {
        let (holder, slot) = slot();
        drop(holder);
        assert_eq!(slot.wait().await, None);
    }

    #[tokio::test]
    async fn test_delivery_to_departed_waiter_is_returned() {
        let (holder, slot) = slot();
        drop(slot);
        assert!(!holder.is_waiting());

        let returned = holder
            .deliver(Delivery::Found(Task::new("t-1", "encode", "wf-1")))
            .unwrap_err();
        assert!(matches!(returned, Delivery::Found(t) if t.task_id == "t-1"));
    }
}
