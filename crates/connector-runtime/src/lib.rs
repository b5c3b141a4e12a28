//! connector-runtime: relays framed execution requests to an HTTP backend
//! under adaptive, bounded concurrency.

pub mod bridge;
pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod downstream;
pub mod latency;
pub mod permit;
pub mod retry;
pub mod runtime;
pub mod shutdown;
pub mod stats;
pub mod tuning;

pub use bridge::codec::{FrameCodec, FrameError, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, RecordCodec};
pub use bridge::protocol::{ErrorClass, ExecutionRequest, ExecutionResponse, MessageType};
pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{ResponseWriter, RuntimeContext};
pub use downstream::{
    BodyFormat, Downstream, DownstreamConfig, DownstreamError, HostPolicy, HttpDownstream,
};
pub use retry::{Classify, RetryPolicy};
pub use runtime::{RunSummary, Runtime, RuntimeError, StopReason};
pub use shutdown::{Phase, ShutdownCoordinator};
pub use stats::StatsSnapshot;
