//! Outbound HTTP calls to the downstream backend.
//!
//! Implements the backend call contract:
//! - Destination host checked against a fixed policy before any network I/O
//! - One POST per attempt, retried with a fixed pause on any failure
//! - Whole call (retries included) bounded by an overall timeout and the
//!   request's own deadline
//! - First textual field of the JSON response becomes the response payload

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tokio_util::bytes::Bytes;

use crate::bridge::codec::MAX_PAYLOAD_LEN;
use crate::bridge::protocol::ErrorClass;
use crate::retry::{Classify, RetryPolicy};

const USER_AGENT: &str = concat!("connector-runtime/", env!("CARGO_PKG_VERSION"));

/// Which destination hosts may be called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPolicy {
    /// Simulated mode: 127.0.0.0/8, ::1 and `localhost` only.
    LoopbackOnly,
    /// Exact (case-insensitive) host names.
    AllowList(Vec<String>),
}

impl HostPolicy {
    pub fn permits(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        match self {
            Self::LoopbackOnly => {
                host.eq_ignore_ascii_case("localhost")
                    || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
            }
            Self::AllowList(hosts) => hosts.iter().any(|h| h.eq_ignore_ascii_case(host)),
        }
    }
}

/// How the request payload becomes the HTTP body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyFormat {
    /// Payload bytes are sent verbatim.
    #[default]
    Passthrough,
    /// Payload is `{"prompt": "..."}`; the prompt is wrapped into a
    /// model-completion body.
    Prompt,
}

impl FromStr for BodyFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" => Ok(Self::Passthrough),
            "prompt" => Ok(Self::Prompt),
            other => Err(format!(
                "unknown body format {other:?} (expected passthrough or prompt)"
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("invalid downstream url: {0}")]
    InvalidUrl(String),
    #[error("destination host {host:?} is not allowed by policy")]
    HostNotAllowed { host: String },
    #[error("invalid request payload: {0}")]
    InvalidPayload(String),
    #[error("downstream returned status {status}")]
    Status { status: u16 },
    #[error("downstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unreadable downstream response: {0}")]
    Decode(String),
    #[error("downstream response has no textual field")]
    NoContent,
    #[error("downstream response of {len} bytes exceeds limit of {max}")]
    ResponseTooLarge { len: usize, max: usize },
    #[error("deadline exceeded after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    #[error("downstream client closed")]
    Closed,
}

impl Classify for DownstreamError {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::InvalidUrl(_) | Self::HostNotAllowed { .. } => ErrorClass::Permanent,
            Self::InvalidPayload(_) => ErrorClass::InvalidRequest,
            Self::Status { status: 429 } => ErrorClass::RateLimited,
            Self::Status { status } if *status >= 500 => ErrorClass::Transient,
            Self::Status { .. } => ErrorClass::Permanent,
            Self::Request(e) if e.is_timeout() => ErrorClass::Timeout,
            Self::Request(_) => ErrorClass::Transient,
            Self::Decode(_) | Self::NoContent | Self::ResponseTooLarge { .. } => {
                ErrorClass::Permanent
            }
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Closed => ErrorClass::Transient,
        }
    }
}

/// Seam between the dispatcher and the backend, so the dispatch path can be
/// exercised without a network.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Relay one request payload. `deadline` is the time left before the
    /// request's own deadline, if it has one.
    async fn call(&self, payload: &[u8], deadline: Option<Duration>)
    -> Result<Vec<u8>, DownstreamError>;

    /// Release pooled connections. Calls made afterwards fail with `Closed`.
    async fn close(&self) {}
}

#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub url: String,
    pub host_policy: HostPolicy,
    pub body_format: BodyFormat,
    pub retry: RetryPolicy,
    /// Overall bound on one call, retries included.
    pub call_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Largest extracted payload relayed back; anything bigger cannot be framed.
    pub max_payload_len: usize,
    pub auth_token: Option<String>,
}

impl DownstreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host_policy: HostPolicy::LoopbackOnly,
            body_format: BodyFormat::default(),
            retry: RetryPolicy::fixed(2, Duration::from_secs(1)),
            call_timeout: Duration::from_secs(70),
            pool_max_idle_per_host: 120,
            max_payload_len: MAX_PAYLOAD_LEN,
            auth_token: None,
        }
    }

    pub fn with_host_policy(mut self, policy: HostPolicy) -> Self {
        self.host_policy = policy;
        self
    }

    pub fn with_body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len.min(MAX_PAYLOAD_LEN);
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }
}

/// Validate the URL against the host policy without building a client.
pub fn validate_destination(url: &str, policy: &HostPolicy) -> Result<Url, DownstreamError> {
    let parsed = Url::parse(url).map_err(|e| DownstreamError::InvalidUrl(e.to_string()))?;
    if !policy.permits(&parsed) {
        return Err(DownstreamError::HostNotAllowed {
            host: parsed.host_str().unwrap_or_default().to_string(),
        });
    }
    Ok(parsed)
}

/// HTTP implementation of [`Downstream`] over a shared reqwest connection pool.
pub struct HttpDownstream {
    url: Url,
    config: DownstreamConfig,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpDownstream {
    pub fn new(config: DownstreamConfig) -> Result<Self, DownstreamError> {
        let url = validate_destination(&config.url, &config.host_policy)?;

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(ref token) = config.auth_token
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(USER_AGENT),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(config.call_timeout)
            .build()?;

        tracing::info!(
            url = %url,
            body_format = ?config.body_format,
            max_retries = config.retry.max_retries,
            call_timeout_ms = config.call_timeout.as_millis() as u64,
            "Downstream client ready"
        );

        Ok(Self {
            url,
            config,
            client: Mutex::new(Some(client)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn client(&self) -> Result<reqwest::Client, DownstreamError> {
        let guard = match self.client.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(DownstreamError::Closed)
    }

    fn build_body(&self, payload: &[u8]) -> Result<Bytes, DownstreamError> {
        match self.config.body_format {
            BodyFormat::Passthrough => Ok(Bytes::copy_from_slice(payload)),
            BodyFormat::Prompt => {
                let request: Value = serde_json::from_slice(payload)
                    .map_err(|e| DownstreamError::InvalidPayload(e.to_string()))?;
                let prompt = request
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let body = serde_json::json!({"contents": [{"parts": [{"text": prompt}]}]});
                Ok(Bytes::from(body.to_string()))
            }
        }
    }

    async fn attempt(&self, body: Bytes, attempt: u32) -> Result<Vec<u8>, DownstreamError> {
        let client = self.client()?;
        tracing::debug!(attempt, url = %self.url, "Calling downstream");

        let response = client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownstreamError::Status {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| DownstreamError::Decode(e.to_string()))?;
        let text = extract_text(&value).ok_or(DownstreamError::NoContent)?;
        if text.len() > self.config.max_payload_len {
            return Err(DownstreamError::ResponseTooLarge {
                len: text.len(),
                max: self.config.max_payload_len,
            });
        }
        Ok(text.as_bytes().to_vec())
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn call(
        &self,
        payload: &[u8],
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, DownstreamError> {
        // Re-checked on every call; the URL is fixed but the policy gate is not optional.
        if !self.config.host_policy.permits(&self.url) {
            return Err(DownstreamError::HostNotAllowed {
                host: self.url.host_str().unwrap_or_default().to_string(),
            });
        }

        let body = self.build_body(payload)?;
        let budget = deadline.map_or(self.config.call_timeout, |d| {
            d.min(self.config.call_timeout)
        });

        let started = Instant::now();
        let attempts = self
            .config
            .retry
            .run(|attempt| self.attempt(body.clone(), attempt));

        match tokio::time::timeout(budget, attempts).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn close(&self) {
        let client = match self.client.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if client.is_some() {
            tracing::debug!("Downstream connection pool closed");
        }
    }
}

/// First string under a `"text"` key (depth-first, document order), falling
/// back to the first string anywhere in the document.
pub fn extract_text(value: &Value) -> Option<&str> {
    find_text_field(value).or_else(|| first_string(value))
}

fn find_text_field(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                return Some(text);
            }
            map.values().find_map(find_text_field)
        }
        Value::Array(items) => items.iter().find_map(find_text_field),
        _ => None,
    }
}

fn first_string(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) => map.values().find_map(first_string),
        Value::Array(items) => items.iter().find_map(first_string),
        _ => None,
    }
}
