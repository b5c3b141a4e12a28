mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use connector_runtime::dispatcher::ResponseWriter;
use connector_runtime::downstream::HttpDownstream;
use connector_runtime::runtime::Runtime;
use connector_runtime::shutdown::wait_for_signal;

use crate::args::Args;

/// Logs always go to stderr: stdout carries response frames.
///
/// `RUST_LOG` wins when set; otherwise `CONNECTOR_LOG` picks the level for
/// this crate. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(log_directive(std::env::var("CONNECTOR_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// One level for every module of this crate, the codec included.
fn log_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("connector_runtime={level}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Args::parse().into_config();
    config.validate().context("invalid configuration")?;

    let downstream =
        HttpDownstream::new(config.downstream()).context("failed to build downstream client")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %downstream.url(),
        simulated = config.simulated,
        "connector-runtime starting"
    );

    let runtime = Runtime::new(
        &config,
        Arc::new(downstream),
        ResponseWriter::new(tokio::io::stdout()),
    );

    let shutdown = runtime.shutdown();
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        shutdown.begin_drain(signal);
    });

    let summary = runtime.run(tokio::io::stdin()).await?;
    tracing::info!(reason = ?summary.reason, "connector-runtime exited");
    Ok(())
}
