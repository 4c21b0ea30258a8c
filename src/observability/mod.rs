// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - log filter (default `info`)
//! - `TENANT_POOL_LOG_FORMAT` - `pretty`, `compact` or `json`
//!
//! Logs always go to stderr: stdout belongs to the CLI's event output.

pub mod metrics;

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl LogFormat {
    /// Format from `TENANT_POOL_LOG_FORMAT`, falling back to the default
    pub fn from_env() -> Self {
        std::env::var("TENANT_POOL_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

/// Install the global tracing subscriber.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_tracing() -> anyhow::Result<()> {
    init_tracing_with(LogFormat::from_env())
}

pub fn init_tracing_with(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    // Already initialized
    let _ = result;
    Ok(())
}

/// Install the Prometheus recorder, serving `/metrics` on `addr`.
///
/// With no address nothing is installed and every metric call is a no-op.
pub fn init_metrics(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics exporter on {}: {}", addr, e))?;

    self::metrics::describe();
    tracing::info!("Metrics exporter listening on {}", addr);
    Ok(())
}
