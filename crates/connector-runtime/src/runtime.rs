//! Accept loop: read request frames, spawn one dispatcher task per request,
//! then drain and tear down.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{FrameError, RecordCodec};
use crate::bridge::protocol::{ErrorClass, ExecutionRequest};
use crate::config::RuntimeConfig;
use crate::dispatcher::{self, ResponseWriter, RuntimeContext};
use crate::downstream::Downstream;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::StatsSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("inbound stream failed: {0}")]
    Protocol(#[from] FrameError),
}

/// Why the accept loop stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Drain requested (signal or caller).
    Cancelled,
    /// Inbound stream ended cleanly at a frame boundary.
    EndOfStream,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::EndOfStream => "end of stream",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub reason: StopReason,
    pub stats: StatsSnapshot,
}

pub struct Runtime {
    ctx: Arc<RuntimeContext>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Runtime {
    pub fn new(
        config: &RuntimeConfig,
        downstream: Arc<dyn Downstream>,
        writer: ResponseWriter,
    ) -> Self {
        Self {
            ctx: RuntimeContext::new(config, downstream, writer),
            shutdown: Arc::new(ShutdownCoordinator::new(config.drain_log_interval)),
        }
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// Handle for requesting a drain from outside the accept loop.
    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// Serve until drained. A protocol error stops intake like a drain
    /// request; in-flight requests still complete before it is returned.
    pub async fn run<R>(self, reader: R) -> Result<RunSummary, RuntimeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, RecordCodec::<ExecutionRequest>::new());
        let token = self.shutdown.token();
        let mut fatal = None;

        tracing::info!(
            limit = self.ctx.admission.limit(),
            max_queue = self.ctx.admission.limits().max_queue,
            "Accepting requests"
        );

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break StopReason::Cancelled,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(request)) => {
                    tracing::trace!(request_id = request.request_id, "Request frame received");
                    let ctx = Arc::clone(&self.ctx);
                    self.shutdown.tracker().spawn(async move {
                        dispatcher::dispatch(&ctx, request).await;
                    });
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Protocol error, closing inbound stream");
                    fatal = Some(e);
                    break StopReason::Cancelled;
                }
                None => {
                    tracing::info!("Inbound stream closed");
                    break StopReason::EndOfStream;
                }
            }
        };

        // Dropping the reader closes our side of the inbound stream.
        drop(frames);

        let drain_reason = match fatal {
            Some(_) => "protocol error",
            None => reason.as_str(),
        };
        self.shutdown.begin_drain(drain_reason);
        self.shutdown.drain().await;

        self.ctx.downstream.close().await;
        if let Err(e) = self.ctx.writer.close().await {
            tracing::warn!(error = %e, "Failed to close response stream");
        }
        self.shutdown.stop();

        let stats = self.ctx.stats.snapshot(self.ctx.admission.snapshot());
        tracing::info!(
            received = stats.received,
            succeeded = stats.succeeded,
            failed = stats.failed,
            transient = stats.failures(ErrorClass::Transient),
            permanent = stats.failures(ErrorClass::Permanent),
            rate_limited = stats.failures(ErrorClass::RateLimited),
            timeouts = stats.failures(ErrorClass::Timeout),
            overloaded = stats.overloaded,
            circuit_rejected = stats.circuit_rejected,
            invalid = stats.invalid,
            "Runtime stopped"
        );

        match fatal {
            Some(e) => Err(RuntimeError::Protocol(e)),
            None => Ok(RunSummary { reason, stats }),
        }
    }
}
