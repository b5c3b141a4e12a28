//! Wire records exchanged with the orchestrator.
//!
//! Two record kinds travel over the duplex stream:
//! - **ExecutionRequest** (orchestrator -> runtime, message type 0x00)
//! - **ExecutionResponse** (runtime -> orchestrator, message type 0x01)
//!
//! Records are serialized as JSON inside a frame; the framing layer treats the
//! body as opaque bytes. Payloads are carried as base64 strings.

use serde::{Deserialize, Serialize};

/// Frame message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ExecuteRequest = 0x00,
    ExecuteResponse = 0x01,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::ExecuteRequest),
            0x01 => Ok(Self::ExecuteResponse),
            other => Err(other),
        }
    }
}

/// Outcome taxonomy reported on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ErrorClass {
    /// Downstream returned usable content.
    Success = 0,
    /// Presumed retryable, but retries were exhausted.
    Transient = 1,
    /// Malformed request, permanent downstream rejection, or policy violation.
    Permanent = 2,
    /// Downstream signaled throttling, or the runtime itself is overloaded.
    RateLimited = 3,
    /// Deadline exceeded before completion.
    Timeout = 4,
    /// Missing required field or unusable payload.
    InvalidRequest = 5,
}

impl ErrorClass {
    /// Only transient, rate-limited and timed-out outcomes are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::Timeout)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorClass> for u8 {
    fn from(class: ErrorClass) -> Self {
        class as u8
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown error class code {0}")]
pub struct UnknownErrorClass(pub u8);

impl TryFrom<u8> for ErrorClass {
    type Error = UnknownErrorClass;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::Transient),
            2 => Ok(Self::Permanent),
            3 => Ok(Self::RateLimited),
            4 => Ok(Self::Timeout),
            5 => Ok(Self::InvalidRequest),
            other => Err(UnknownErrorClass(other)),
        }
    }
}

/// A record that travels inside a frame of a fixed message type.
pub trait Record: Serialize + serde::de::DeserializeOwned {
    const MESSAGE_TYPE: MessageType;
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Execution request sent by the orchestrator. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: u64,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub connector_name: String,
    pub operation: String,
    /// Absolute epoch milliseconds by which the response must be produced.
    pub deadline_at_ms: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl ExecutionRequest {
    /// Name of the first required string field that is empty, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.tenant_id.trim().is_empty() {
            Some("tenant_id")
        } else if self.connector_name.trim().is_empty() {
            Some("connector_name")
        } else if self.operation.trim().is_empty() {
            Some("operation")
        } else {
            None
        }
    }

    /// Milliseconds left until the deadline, relative to `now_ms` (epoch ms).
    /// Zero when the deadline has already passed.
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.deadline_at_ms.saturating_sub(now_ms)
    }
}

impl Record for ExecutionRequest {
    const MESSAGE_TYPE: MessageType = MessageType::ExecuteRequest;
}

/// Execution response written back to the orchestrator.
///
/// `error_message` is present iff `error_class` is not SUCCESS; the
/// constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    request_id: u64,
    error_class: ErrorClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    done: bool,
    duration_us: u64,
}

impl ExecutionResponse {
    pub fn success(request_id: u64, payload: Vec<u8>, duration_us: u64) -> Self {
        Self {
            request_id,
            error_class: ErrorClass::Success,
            error_message: None,
            payload,
            done: true,
            duration_us,
        }
    }

    /// Failure response. A `Success` class is coerced to `Transient` so that
    /// the message/class pairing stays consistent.
    pub fn failure(
        request_id: u64,
        error_class: ErrorClass,
        message: impl Into<String>,
        duration_us: u64,
    ) -> Self {
        let error_class = if error_class.is_success() {
            ErrorClass::Transient
        } else {
            error_class
        };
        Self {
            request_id,
            error_class,
            error_message: Some(message.into()),
            payload: Vec::new(),
            done: true,
            duration_us,
        }
    }

    /// Synthetic 503 produced when the queue-depth ceiling is hit.
    pub fn overloaded(request_id: u64, duration_us: u64) -> Self {
        let body = serde_json::json!({"status": 503, "body": "Overloaded"});
        Self {
            request_id,
            error_class: ErrorClass::RateLimited,
            error_message: Some("Overloaded".to_string()),
            payload: body.to_string().into_bytes(),
            done: true,
            duration_us,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn error_class(&self) -> ErrorClass {
        self.error_class
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn duration_us(&self) -> u64 {
        self.duration_us
    }
}

impl Record for ExecutionResponse {
    const MESSAGE_TYPE: MessageType = MessageType::ExecuteResponse;
}
