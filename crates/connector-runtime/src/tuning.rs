//! Adaptive concurrency: additive-increase / additive-decrease of the admission
//! limit driven by the rolling latency average.
//!
//! Tuning runs once per completed request rather than on a timer, so its cadence
//! follows the request rate.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::latency::RollingLatencyWindow;
use crate::permit::AdmissionController;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningConfig {
    /// Average latency above which the limit shrinks.
    pub latency_threshold: Duration,
    /// Fraction of the threshold below which the limit grows.
    pub grow_ratio: f64,
    /// Size of one adjustment.
    pub step: usize,
    /// Number of samples averaged.
    pub window: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            latency_threshold: Duration::from_millis(10_000),
            grow_ratio: 0.65,
            step: 4,
            window: crate::latency::DEFAULT_WINDOW,
        }
    }
}

/// Proposed change to the admission limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Shrink { from: usize, to: usize },
    Grow { from: usize, to: usize },
    Hold,
}

pub struct AdaptiveConcurrencyController {
    config: TuningConfig,
    window: Mutex<RollingLatencyWindow>,
    admission: Arc<AdmissionController>,
}

impl AdaptiveConcurrencyController {
    pub fn new(config: TuningConfig, admission: Arc<AdmissionController>) -> Self {
        Self {
            window: Mutex::new(RollingLatencyWindow::new(config.window)),
            config,
            admission,
        }
    }

    fn window(&self) -> MutexGuard<'_, RollingLatencyWindow> {
        match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Latency window mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Mean of the sampled latencies in milliseconds.
    pub fn average_latency(&self) -> Option<f64> {
        self.window().average()
    }

    /// Record one completed request and re-tune. Returns the adjustment applied.
    pub fn record(&self, latency: Duration) -> Adjustment {
        let average = {
            let mut window = self.window();
            window.push(latency.as_secs_f64() * 1000.0);
            window.average()
        };

        let Some(average_ms) = average else {
            return Adjustment::Hold;
        };

        let adjustment = self.propose(average_ms, self.admission.target());
        match adjustment {
            Adjustment::Shrink { to, .. } | Adjustment::Grow { to, .. } => {
                let applied = self.admission.resize(to);
                tracing::info!(
                    limit = applied,
                    average_latency_ms = average_ms as u64,
                    "Concurrency adjusted"
                );
            }
            Adjustment::Hold => {}
        }
        adjustment
    }

    /// Pure decision step, separated for testing.
    ///
    /// Moves are whole steps; a partial move is only taken when it lands exactly
    /// on the floor or the cap, so the limit can settle on either bound.
    pub fn propose(&self, average_ms: f64, current: usize) -> Adjustment {
        let limits = self.admission.limits();
        let threshold_ms = self.config.latency_threshold.as_secs_f64() * 1000.0;
        let step = self.config.step;

        let proposed = if average_ms > threshold_ms {
            current.saturating_sub(step).max(limits.min_inflight)
        } else if average_ms < threshold_ms * self.config.grow_ratio {
            (current + step).min(limits.max_inflight)
        } else {
            current
        };

        let delta = proposed.abs_diff(current);
        let at_bound = proposed == limits.min_inflight || proposed == limits.max_inflight;
        if delta == 0 || (delta < step && !at_bound) {
            return Adjustment::Hold;
        }

        if proposed < current {
            Adjustment::Shrink {
                from: current,
                to: proposed,
            }
        } else {
            Adjustment::Grow {
                from: current,
                to: proposed,
            }
        }
    }
}
