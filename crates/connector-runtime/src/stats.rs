//! Process-lifetime outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bridge::protocol::ErrorClass;
use crate::permit::AdmissionSnapshot;

/// One slot per wire error class code.
const CLASS_COUNT: usize = 6;

#[derive(Debug, Default)]
pub struct RuntimeStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    failed_by_class: [AtomicU64; CLASS_COUNT],
    overloaded: AtomicU64,
    circuit_rejected: AtomicU64,
    invalid: AtomicU64,
}

/// How a dispatched request ended, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(ErrorClass),
    Overloaded,
    CircuitOpen,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// `failed` broken down by error class code.
    pub failed_by_class: [u64; CLASS_COUNT],
    pub overloaded: u64,
    pub circuit_rejected: u64,
    pub invalid: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub limit: usize,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Failed(class) => {
                self.failed_by_class[usize::from(u8::from(class))].fetch_add(1, Ordering::Relaxed);
                &self.failed
            }
            Outcome::Overloaded => &self.overloaded,
            Outcome::CircuitOpen => &self.circuit_rejected,
            Outcome::Invalid => &self.invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, admission: AdmissionSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            failed_by_class: std::array::from_fn(|i| {
                self.failed_by_class[i].load(Ordering::Relaxed)
            }),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            queue_depth: admission.queue_depth,
            in_flight: admission.in_flight,
            limit: admission.limit,
        }
    }
}

impl StatsSnapshot {
    /// Requests that have produced a response.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.overloaded + self.circuit_rejected + self.invalid
    }

    /// Failed requests that ended with `class`.
    pub fn failures(&self, class: ErrorClass) -> u64 {
        self.failed_by_class[usize::from(u8::from(class))]
    }
}
