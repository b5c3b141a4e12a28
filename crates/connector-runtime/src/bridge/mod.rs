//! IPC bridge between the orchestrator and the runtime.
//!
//! This module provides the wire protocol and codec for the duplex stream the
//! orchestrator drives (stdin/stdout in production).
//!
//! # Architecture
//!
//! - **protocol**: Record types (ExecutionRequest/Response, ErrorClass, MessageType)
//! - **codec**: Length-prefixed framing plus JSON record codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
