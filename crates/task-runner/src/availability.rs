//! Availability gate consulted before polling
//!
//! Service discovery keeps its own view of whether this instance should take
//! traffic. The runner only polls while the gate reports [`InstanceStatus::Up`],
//! unless the worker properties override discovery.

use std::sync::atomic::{AtomicU8, Ordering};

/// Instance status as reported by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Up,
            1 => Self::Down,
            2 => Self::Starting,
            3 => Self::OutOfService,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Starting => 2,
            Self::OutOfService => 3,
            Self::Unknown => 4,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
            Self::Starting => write!(f, "STARTING"),
            Self::OutOfService => write!(f, "OUT_OF_SERVICE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Source of this instance's remote status
pub trait AvailabilityGate: Send + Sync {
    fn instance_status(&self) -> InstanceStatus;
}

/// Gate whose status is set by the application
///
/// # Example
///
/// ```
/// use task_runner::availability::{AvailabilityGate, InstanceStatus, ManualGate};
///
/// let gate = ManualGate::new(InstanceStatus::Starting);
/// gate.set_status(InstanceStatus::Up);
/// assert_eq!(gate.instance_status(), InstanceStatus::Up);
/// ```
#[derive(Debug)]
pub struct ManualGate {
    status: AtomicU8,
}

impl ManualGate {
    pub fn new(status: InstanceStatus) -> Self {
        Self {
            status: AtomicU8::new(status.as_u8()),
        }
    }

    pub fn set_status(&self, status: InstanceStatus) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }
}

impl Default for ManualGate {
    fn default() -> Self {
        Self::new(InstanceStatus::Up)
    }
}

impl AvailabilityGate for ManualGate {
    fn instance_status(&self) -> InstanceStatus {
        InstanceStatus::from_u8(self.status.load(Ordering::Relaxed))
    }
}
