//! Graceful drain: Running -> Draining -> Stopped.
//!
//! The accept loop watches the cancellation token and stops reading frames
//! once it fires. Dispatched tasks live on the task tracker, and the drain
//! waits for the tracker to empty instead of polling a counter.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Stopped,
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
    phase: watch::Sender<Phase>,
    log_interval: Duration,
}

impl ShutdownCoordinator {
    pub fn new(log_interval: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            phase,
            log_interval,
        }
    }

    /// Token cancelled when draining begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker every dispatched task must be spawned on.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Move Running -> Draining. Returns false if draining had already begun.
    pub fn begin_drain(&self, reason: &str) -> bool {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
        if started {
            tracing::info!(reason, in_flight = self.tracker.len(), "Draining");
            self.token.cancel();
        }
        started
    }

    /// Wait for every tracked task to finish, reporting progress periodically.
    pub async fn drain(&self) {
        self.begin_drain("drain requested");
        self.tracker.close();

        let mut ticker = tokio::time::interval(self.log_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let idle = self.tracker.wait();
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = &mut idle => break,
                _ = ticker.tick() => {
                    tracing::info!(remaining = self.tracker.len(), "Waiting for in-flight requests");
                }
            }
        }
        tracing::info!("All in-flight requests completed");
    }

    pub fn stop(&self) {
        self.phase.send_replace(Phase::Stopped);
    }
}

/// Resolves on SIGINT or SIGTERM and names the signal.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
