//! Admission control for downstream concurrency.
//!
//! Two gates guard every request:
//! - `QueueTicket`: hard queue-depth ceiling, checked without waiting (backpressure)
//! - `AdmissionPermit`: resizable concurrency permit, awaited (returns to pool on drop)

mod pool;
mod ticket;

pub use pool::{AdmissionController, AdmissionLimits, AdmissionPermit, AdmissionSnapshot};
pub use ticket::QueueTicket;
