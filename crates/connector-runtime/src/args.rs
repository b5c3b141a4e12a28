use std::time::Duration;

use clap::Parser;

use connector_runtime::config::{DEFAULT_BACKEND_URL, RuntimeConfig};
use connector_runtime::downstream::BodyFormat;

/// Relay framed execution requests from stdin to an HTTP backend, writing
/// framed responses to stdout.
#[derive(Debug, Parser)]
#[command(name = "connector-runtime", version)]
pub struct Args {
    #[arg(long, env = "CONNECTOR_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    pub backend_url: String,

    /// Only loopback destinations are permitted.
    #[arg(
        long,
        env = "CONNECTOR_SIMULATED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub simulated: bool,

    /// Comma-separated hosts permitted when not simulated.
    #[arg(long, env = "CONNECTOR_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Vec<String>,

    /// passthrough | prompt
    #[arg(long, env = "CONNECTOR_BODY_FORMAT", default_value = "passthrough")]
    pub body_format: BodyFormat,

    #[arg(long, env = "CONNECTOR_MAX_QUEUE", default_value_t = 200)]
    pub max_queue: usize,

    #[arg(long, env = "CONNECTOR_MIN_INFLIGHT", default_value_t = 30)]
    pub min_inflight: usize,

    #[arg(long, env = "CONNECTOR_MAX_INFLIGHT", default_value_t = 80)]
    pub max_inflight: usize,

    #[arg(long, env = "CONNECTOR_MAX_RETRY", default_value_t = 2)]
    pub max_retry: u32,

    #[arg(long, env = "CONNECTOR_CALL_TIMEOUT_MS", default_value_t = 70_000)]
    pub call_timeout_ms: u64,

    #[arg(long, env = "CONNECTOR_LATENCY_THRESHOLD_MS", default_value_t = 10_000)]
    pub latency_threshold_ms: u64,

    #[arg(long, env = "CONNECTOR_FAIL_THRESHOLD", default_value_t = 12)]
    pub fail_threshold: u32,

    #[arg(long, env = "CONNECTOR_RESET_AFTER_MS", default_value_t = 10_000)]
    pub reset_after_ms: u64,

    /// Bearer token sent to the backend.
    #[arg(long, env = "CONNECTOR_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,
}

impl Args {
    pub fn into_config(self) -> RuntimeConfig {
        RuntimeConfig::new(self.backend_url)
            .with_simulated(self.simulated)
            .with_allowed_hosts(self.allowed_hosts)
            .with_body_format(self.body_format)
            .with_admission(self.max_queue, self.min_inflight, self.max_inflight)
            .with_max_retry(self.max_retry)
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
            .with_latency_threshold(Duration::from_millis(self.latency_threshold_ms))
            .with_breaker(self.fail_threshold, Duration::from_millis(self.reset_after_ms))
            .with_auth_token(self.auth_token)
    }
}
