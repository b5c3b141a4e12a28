//! Consecutive-failure circuit breaker for the downstream backend.
//!
//! There is no explicit half-open state: once `open_until` elapses the next
//! request is let through and acts as the probe. A single success resets the
//! failure count. Nothing is persisted across restarts.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Longest open window honored; longer settings are clamped to it.
pub const MAX_RESET_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub fail_threshold: u32,
    /// How long the breaker stays open once tripped.
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 12,
            reset_after: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                failure_count: 0,
                open_until: None,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BreakerState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Circuit breaker mutex poisoned - recovering");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }

    /// False while the breaker is open; callers must fail fast.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        self.with_state(|s| s.open_until.is_none_or(|until| now >= until))
    }

    pub fn success(&self) {
        self.with_state(|s| s.failure_count = 0);
    }

    /// Record a failure. Returns true if this call tripped the breaker.
    pub fn failure(&self) -> bool {
        let tripped = self.with_state(|s| {
            s.failure_count += 1;
            if s.failure_count >= self.config.fail_threshold {
                let now = Instant::now();
                let reset_after = self.config.reset_after.min(MAX_RESET_AFTER);
                s.open_until = Some(now.checked_add(reset_after).unwrap_or(now));
                s.failure_count = 0;
                true
            } else {
                false
            }
        });
        if tripped {
            tracing::warn!(
                fail_threshold = self.config.fail_threshold,
                reset_after_ms = self.config.reset_after.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
        tripped
    }

    pub fn failure_count(&self) -> u32 {
        self.with_state(|s| s.failure_count)
    }

    pub fn is_open(&self) -> bool {
        !self.allow()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
