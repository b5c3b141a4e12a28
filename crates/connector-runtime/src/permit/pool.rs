//! Resizable permit pool (a semaphore whose capacity changes at runtime).
//!
//! Growing the pool wakes waiters immediately. Shrinking never revokes a held
//! permit: the effective limit reported is `max(target, in_flight)`, which
//! converges down to the target as permits are returned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use super::QueueTicket;

/// Bounds for the permit pool and the queue in front of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub initial: usize,
    pub min_inflight: usize,
    pub max_inflight: usize,
    pub max_queue: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            initial: 80,
            min_inflight: 30,
            max_inflight: 80,
            max_queue: 200,
        }
    }
}

/// Point-in-time view of the admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    /// Effective ceiling: never below `in_flight`, converges to `target`.
    pub limit: usize,
    /// Limit most recently requested through `resize`.
    pub target: usize,
    pub in_flight: usize,
    pub available: usize,
    pub queue_depth: usize,
    pub max_queue: usize,
}

struct PoolState {
    target: usize,
    in_flight: usize,
}

impl PoolState {
    fn limit(&self) -> usize {
        self.target.max(self.in_flight)
    }

    fn available(&self) -> usize {
        self.target.saturating_sub(self.in_flight)
    }
}

/// Permit pool plus queue-depth counter shared by all dispatcher tasks.
pub struct AdmissionController {
    state: Mutex<PoolState>,
    released: Notify,
    limits: AdmissionLimits,
    pub(super) queue_depth: AtomicUsize,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Arc<Self> {
        let target = limits
            .initial
            .clamp(limits.min_inflight, limits.max_inflight);
        Arc::new(Self {
            state: Mutex::new(PoolState {
                target,
                in_flight: 0,
            }),
            released: Notify::new(),
            limits,
            queue_depth: AtomicUsize::new(0),
        })
    }

    /// Lock the pool state, recovering from a poisoned mutex (the state is two
    /// counters and stays consistent across a panic).
    fn state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Admission state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Enter the queue. Returns `None` when the queue-depth ceiling is reached;
    /// the caller must reject the request without touching the permit pool.
    pub fn try_enqueue(self: &Arc<Self>) -> Option<QueueTicket> {
        let max_queue = self.limits.max_queue;
        self.queue_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < max_queue).then_some(depth + 1)
            })
            .ok()
            .map(|_| QueueTicket::new(Arc::clone(self)))
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut state = self.state();
        if state.in_flight < state.target {
            state.in_flight += 1;
            Some(AdmissionPermit {
                pool: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Wait until a permit is available.
    pub async fn acquire(self: &Arc<Self>) -> AdmissionPermit {
        loop {
            // Register interest before checking, so a release between the check
            // and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    /// Change the permit count live. Returns the applied (clamped) target.
    pub fn resize(&self, new_limit: usize) -> usize {
        let new_limit = new_limit.clamp(self.limits.min_inflight, self.limits.max_inflight);
        let grew = {
            let mut state = self.state();
            let old = state.target;
            state.target = new_limit;
            new_limit > old
        };
        if grew {
            self.released.notify_waiters();
        }
        new_limit
    }

    fn release(&self) {
        let wake = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight < state.target
        };
        if wake {
            self.released.notify_one();
        }
    }

    pub fn target(&self) -> usize {
        self.state().target
    }

    pub fn limit(&self) -> usize {
        self.state().limit()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    pub fn available(&self) -> usize {
        self.state().available()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state();
        AdmissionSnapshot {
            limit: state.limit(),
            target: state.target,
            in_flight: state.in_flight,
            available: state.available(),
            queue_depth: self.queue_depth(),
            max_queue: self.limits.max_queue,
        }
    }
}

/// A held concurrency permit - returns to the pool on drop.
#[must_use = "dropping the permit releases it immediately"]
pub struct AdmissionPermit {
    pool: Arc<AdmissionController>,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}
