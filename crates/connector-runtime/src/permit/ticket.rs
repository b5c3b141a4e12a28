//! Queue-depth ticket held for the whole life of an accepted request.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::AdmissionController;

/// Proof that a request passed the queue-depth gate. Decrements the depth on drop,
/// so the counter is released on every exit path of the dispatcher.
#[must_use = "dropping the ticket leaves the queue immediately"]
pub struct QueueTicket {
    pool: Arc<AdmissionController>,
}

impl QueueTicket {
    pub(super) fn new(pool: Arc<AdmissionController>) -> Self {
        Self { pool }
    }

    /// Queue depth including this ticket.
    pub fn depth(&self) -> usize {
        self.pool.queue_depth()
    }
}

impl std::fmt::Debug for QueueTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTicket")
            .field("depth", &self.depth())
            .finish()
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.pool.queue_depth.fetch_sub(1, Ordering::AcqRel);
    }
}
