//! Per-request state machine.
//!
//! ```text
//! received -> validated -> queued -> Admitted -> CircuitChecked -> Calling -> Responding -> Done
//!                |            |                        |              |
//!                v            v                        v              v
//!             Invalid      Rejected               CircuitOpen       Failed
//! ```
//!
//! Every path that gets past validation writes exactly one response frame.
//! Permits and queue tickets are RAII guards, so release is unconditional.

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{FrameError, RecordCodec};
use crate::bridge::protocol::{ErrorClass, ExecutionRequest, ExecutionResponse};
use crate::breaker::CircuitBreaker;
use crate::config::RuntimeConfig;
use crate::downstream::{Downstream, DownstreamError};
use crate::permit::AdmissionController;
use crate::retry::Classify;
use crate::stats::{Outcome, RuntimeStats};
use crate::tuning::AdaptiveConcurrencyController;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Single serialized writer for response frames.
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<tokio::sync::Mutex<FramedWrite<BoxedWrite, RecordCodec<ExecutionResponse>>>>,
}

impl ResponseWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let boxed: BoxedWrite = Box::new(writer);
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                boxed,
                RecordCodec::new(),
            ))),
        }
    }

    /// Encode and flush one frame. Holding the lock across the write keeps
    /// frames from interleaving.
    pub async fn send(&self, response: ExecutionResponse) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        writer.send(response).await
    }

    /// Flush and shut down the underlying stream.
    pub async fn close(&self) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        SinkExt::<ExecutionResponse>::close(&mut *writer).await
    }
}

/// State shared by every dispatcher task.
pub struct RuntimeContext {
    pub admission: Arc<AdmissionController>,
    pub breaker: CircuitBreaker,
    pub tuner: AdaptiveConcurrencyController,
    pub downstream: Arc<dyn Downstream>,
    pub writer: ResponseWriter,
    pub stats: RuntimeStats,
}

impl RuntimeContext {
    pub fn new(
        config: &RuntimeConfig,
        downstream: Arc<dyn Downstream>,
        writer: ResponseWriter,
    ) -> Arc<Self> {
        let admission = AdmissionController::new(config.admission);
        Arc::new(Self {
            tuner: AdaptiveConcurrencyController::new(config.tuning, Arc::clone(&admission)),
            admission,
            breaker: CircuitBreaker::new(config.breaker),
            downstream,
            writer,
            stats: RuntimeStats::new(),
        })
    }
}

/// Why a request did not produce a successful response.
#[derive(Debug)]
enum Failure {
    Invalid(&'static str),
    Overloaded,
    CircuitOpen,
    DeadlinePassed,
    Downstream(DownstreamError),
}

impl Failure {
    fn into_response(self, request_id: u64, duration_us: u64) -> (ExecutionResponse, Outcome) {
        match self {
            Self::Invalid(field) => (
                ExecutionResponse::failure(
                    request_id,
                    ErrorClass::InvalidRequest,
                    format!("missing required field: {field}"),
                    duration_us,
                ),
                Outcome::Invalid,
            ),
            Self::Overloaded => (
                ExecutionResponse::overloaded(request_id, duration_us),
                Outcome::Overloaded,
            ),
            Self::CircuitOpen => (
                ExecutionResponse::failure(
                    request_id,
                    ErrorClass::Transient,
                    "circuit open",
                    duration_us,
                ),
                Outcome::CircuitOpen,
            ),
            Self::DeadlinePassed => (
                ExecutionResponse::failure(
                    request_id,
                    ErrorClass::Timeout,
                    "deadline passed before downstream call",
                    duration_us,
                ),
                Outcome::Failed(ErrorClass::Timeout),
            ),
            Self::Downstream(e) => {
                let class = e.error_class();
                (
                    ExecutionResponse::failure(request_id, class, e.to_string(), duration_us),
                    Outcome::Failed(class),
                )
            }
        }
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Run one request to completion and write its response.
///
/// Admitted requests are timed from permit acquisition, so neither
/// `duration_us` nor the tuner's samples include time spent queued.
pub async fn dispatch(ctx: &RuntimeContext, request: ExecutionRequest) {
    let received = Instant::now();
    ctx.stats.record_received();

    if let Some(field) = request.missing_field() {
        respond(ctx, &request, Err(Failure::Invalid(field)), received).await;
        return;
    }

    let Some(ticket) = ctx.admission.try_enqueue() else {
        respond(ctx, &request, Err(Failure::Overloaded), received).await;
        return;
    };

    let permit = ctx.admission.acquire().await;
    let started = Instant::now();
    tracing::trace!(
        request_id = request.request_id,
        queued_us = u64::try_from((started - received).as_micros()).unwrap_or(u64::MAX),
        "Admitted"
    );

    let result = call_downstream(ctx, &request).await;
    let latency = respond(ctx, &request, result, started).await;
    ctx.tuner.record(latency);

    drop(permit);
    drop(ticket);
}

async fn call_downstream(ctx: &RuntimeContext, request: &ExecutionRequest) -> Result<Vec<u8>, Failure> {
    if !ctx.breaker.allow() {
        return Err(Failure::CircuitOpen);
    }

    // A zero deadline means the caller set none; the call timeout still applies.
    let deadline = match request.deadline_at_ms {
        0 => None,
        _ => match request.remaining_ms(now_ms()) {
            0 => return Err(Failure::DeadlinePassed),
            remaining => Some(Duration::from_millis(remaining)),
        },
    };

    match ctx.downstream.call(&request.payload, deadline).await {
        Ok(payload) => {
            ctx.breaker.success();
            Ok(payload)
        }
        Err(e) => {
            // A bad payload says nothing about backend health.
            if e.error_class() != ErrorClass::InvalidRequest {
                ctx.breaker.failure();
            }
            Err(Failure::Downstream(e))
        }
    }
}

/// Build, account for, log and write the response. Returns the elapsed time
/// recorded in the response.
async fn respond(
    ctx: &RuntimeContext,
    request: &ExecutionRequest,
    result: Result<Vec<u8>, Failure>,
    started: Instant,
) -> Duration {
    let elapsed = started.elapsed();
    let duration_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    let request_id = request.request_id;

    let (response, outcome) = match result {
        Ok(payload) => (
            ExecutionResponse::success(request_id, payload, duration_us),
            Outcome::Succeeded,
        ),
        Err(failure) => failure.into_response(request_id, duration_us),
    };

    let error_class = response.error_class();
    if error_class.is_success() {
        tracing::debug!(
            request_id,
            tenant_id = %request.tenant_id,
            trace_id = request.trace_id.as_deref(),
            connector = %request.connector_name,
            error_class = %error_class,
            duration_us,
            "Request completed"
        );
    } else {
        tracing::warn!(
            request_id,
            tenant_id = %request.tenant_id,
            trace_id = request.trace_id.as_deref(),
            connector = %request.connector_name,
            error_class = %error_class,
            error = response.error_message().unwrap_or_default(),
            duration_us,
            "Request failed"
        );
    }

    let outcome = match ctx.writer.send(response).await {
        Ok(()) => outcome,
        // Nothing was written; the caller still gets exactly one frame.
        Err(FrameError::FrameTooLarge { len, max }) => {
            tracing::warn!(request_id, len, max, "Response exceeds frame limit");
            let fallback = ExecutionResponse::failure(
                request_id,
                ErrorClass::Permanent,
                format!("response of {len} bytes exceeds frame limit of {max}"),
                duration_us,
            );
            if let Err(e) = ctx.writer.send(fallback).await {
                tracing::error!(request_id, error = %e, "Failed to write response frame");
            }
            Outcome::Failed(ErrorClass::Permanent)
        }
        Err(e) => {
            tracing::error!(request_id, error = %e, "Failed to write response frame");
            outcome
        }
    };
    ctx.stats.record(outcome);
    elapsed
}
