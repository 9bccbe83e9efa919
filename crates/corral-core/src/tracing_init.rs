//! Shared tracing/logging initialization.
//!
//! Embedders of the runtime call [`init_tracing`] once at startup to install a
//! `tracing_subscriber` registry with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::{Error, Result};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"corral_runtime=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Fails instead of panicking when a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!log_json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| Error::Tracing(e.to_string()))
}

/// [`init_tracing`] with the filter derived from `config.log_level`.
///
/// `RUST_LOG` still takes precedence when set.
pub fn init_tracing_from_config(config: &Config, log_json: bool) -> Result<()> {
    init_tracing(&config.log_filter(), log_json)
}

/// Like [`init_tracing`], additionally exporting spans through the
/// `OpenTelemetry` pipeline held by `guard`.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_otel(
    default_filter: &str,
    log_json: bool,
    guard: &crate::metrics::MetricsGuard,
) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!log_json).then(tracing_subscriber::fmt::layer))
        .with(guard.tracing_layer())
        .try_init()
        .map_err(|e| Error::Tracing(e.to_string()))
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}
