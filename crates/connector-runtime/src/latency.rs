//! Rolling window of recent request latencies.

use std::collections::VecDeque;

/// Default number of samples kept.
pub const DEFAULT_WINDOW: usize = 80;

/// Fixed-size FIFO of latency samples in milliseconds.
#[derive(Debug, Clone)]
pub struct RollingLatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingLatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest once full.
    pub fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Mean of the current samples, `None` while empty.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for RollingLatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
