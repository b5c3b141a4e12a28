//! Runtime configuration, resolved once at startup.

use std::time::Duration;

use crate::breaker::{BreakerConfig, MAX_RESET_AFTER};
use crate::downstream::{self, BodyFormat, DownstreamConfig, DownstreamError, HostPolicy};
use crate::permit::AdmissionLimits;
use crate::retry::RetryPolicy;
use crate::tuning::TuningConfig;

pub const DEFAULT_BACKEND_URL: &str =
    "http://127.0.0.1:4545/v1beta/models/gemini-2.5-flash:generateContent";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("min_inflight ({min}) must be between 1 and max_inflight ({max})")]
    InflightBounds { min: usize, max: usize },
    #[error("max_queue must be at least 1")]
    ZeroQueue,
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("reset_after must not exceed {}s", MAX_RESET_AFTER.as_secs())]
    ResetTooLong,
    #[error("fail_threshold must be at least 1")]
    ZeroFailThreshold,
    #[error("tuning step must be at least 1")]
    ZeroStep,
    #[error("grow_ratio {0} must be within (0, 1)")]
    GrowRatio(f64),
    #[error("allowed host list is empty; set allowed hosts or enable simulated mode")]
    EmptyAllowList,
    #[error(transparent)]
    Destination(#[from] DownstreamError),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub backend_url: String,
    /// Simulated backend: only loopback destinations are permitted.
    pub simulated: bool,
    /// Permitted hosts when not simulated.
    pub allowed_hosts: Vec<String>,
    pub body_format: BodyFormat,
    pub admission: AdmissionLimits,
    pub max_retry: u32,
    pub retry_pause: Duration,
    pub call_timeout: Duration,
    pub tuning: TuningConfig,
    pub breaker: BreakerConfig,
    pub auth_token: Option<String>,
    /// How often the drain reports what is still in flight.
    pub drain_log_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            simulated: true,
            allowed_hosts: Vec::new(),
            body_format: BodyFormat::default(),
            admission: AdmissionLimits::default(),
            max_retry: 2,
            retry_pause: Duration::from_secs(1),
            call_timeout: Duration::from_secs(70),
            tuning: TuningConfig::default(),
            breaker: BreakerConfig::default(),
            auth_token: None,
            drain_log_interval: Duration::from_millis(500),
        }
    }
}

impl RuntimeConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Self::default()
        }
    }

    pub fn with_simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    pub fn with_body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    /// Sets the queue ceiling and the inflight bounds. The pool starts at the cap.
    pub fn with_admission(mut self, max_queue: usize, min_inflight: usize, max_inflight: usize) -> Self {
        self.admission = AdmissionLimits {
            initial: max_inflight,
            min_inflight,
            max_inflight,
            max_queue,
        };
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_latency_threshold(mut self, threshold: Duration) -> Self {
        self.tuning.latency_threshold = threshold;
        self
    }

    pub fn with_breaker(mut self, fail_threshold: u32, reset_after: Duration) -> Self {
        self.breaker = BreakerConfig {
            fail_threshold,
            reset_after,
        };
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_drain_log_interval(mut self, interval: Duration) -> Self {
        self.drain_log_interval = interval;
        self
    }

    pub fn host_policy(&self) -> HostPolicy {
        if self.simulated {
            HostPolicy::LoopbackOnly
        } else {
            HostPolicy::AllowList(self.allowed_hosts.clone())
        }
    }

    pub fn downstream(&self) -> DownstreamConfig {
        DownstreamConfig::new(self.backend_url.clone())
            .with_host_policy(self.host_policy())
            .with_body_format(self.body_format)
            .with_retry(RetryPolicy::fixed(self.max_retry, self.retry_pause))
            .with_call_timeout(self.call_timeout)
            .with_auth_token(self.auth_token.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let AdmissionLimits {
            min_inflight,
            max_inflight,
            max_queue,
            ..
        } = self.admission;
        if min_inflight == 0 || min_inflight > max_inflight {
            return Err(ConfigError::InflightBounds {
                min: min_inflight,
                max: max_inflight,
            });
        }
        if max_queue == 0 {
            return Err(ConfigError::ZeroQueue);
        }

        for (name, value) in [
            ("call_timeout", self.call_timeout),
            ("latency_threshold", self.tuning.latency_threshold),
            ("reset_after", self.breaker.reset_after),
            ("drain_log_interval", self.drain_log_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if self.breaker.reset_after > MAX_RESET_AFTER {
            return Err(ConfigError::ResetTooLong);
        }
        if self.breaker.fail_threshold == 0 {
            return Err(ConfigError::ZeroFailThreshold);
        }
        if self.tuning.step == 0 {
            return Err(ConfigError::ZeroStep);
        }
        let ratio = self.tuning.grow_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(ConfigError::GrowRatio(ratio));
        }

        if !self.simulated && self.allowed_hosts.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        downstream::validate_destination(&self.backend_url, &self.host_policy())?;
        Ok(())
    }
}
