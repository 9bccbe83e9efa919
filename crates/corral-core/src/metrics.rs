//! OTLP export pipeline for Corral telemetry.
//!
//! Compiled only with the `metrics` feature. [`init_metrics`] builds the
//! span and metric exporters described by [`TelemetryConfig`], tags both with
//! the configured `service.name`, and returns a [`MetricsGuard`]. The guard
//! hands out the [`Meter`] the runtime's `OtelMetrics` sink records through
//! and the `tracing` layer that [`crate::tracing_init::init_tracing_with_otel`]
//! installs.

use opentelemetry::global;
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tracing::info;
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::config::TelemetryConfig;

/// Instrumentation scope for everything Corral exports.
const SCOPE: &str = "corral";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("telemetry.otlp_endpoint is not set")]
    NoEndpoint,

    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the tracer and meter providers alive.
///
/// Dropping the guard does not flush; call [`MetricsGuard::shutdown`].
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Meter for the runtime's metric instruments.
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(SCOPE)
    }

    /// A `tracing` layer that exports spans through this pipeline.
    pub fn tracing_layer<S>(&self) -> OpenTelemetryLayer<S, SdkTracer>
    where
        S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
    {
        tracing_opentelemetry::layer().with_tracer(self.tracer_provider.tracer(SCOPE))
    }

    /// Flush and stop both providers.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

impl std::fmt::Debug for MetricsGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsGuard").finish_non_exhaustive()
    }
}

/// Build the OTLP pipeline from `config` and register it globally.
///
/// Fails with [`MetricsError::NoEndpoint`] when no endpoint is configured.
pub fn init_metrics(config: &TelemetryConfig) -> Result<MetricsGuard, MetricsError> {
    let endpoint = config
        .otlp_endpoint
        .as_deref()
        .ok_or(MetricsError::NoEndpoint)?;
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource.clone())
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let reader = PeriodicReader::builder(metric_exporter)
        .with_interval(config.export_interval())
        .build();
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    global::set_meter_provider(meter_provider.clone());

    info!(
        endpoint,
        service_name = %config.service_name,
        interval = ?config.export_interval(),
        "OTLP telemetry export enabled"
    );
    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_is_rejected() {
        let err = init_metrics(&TelemetryConfig::default()).unwrap_err();
        assert!(matches!(err, MetricsError::NoEndpoint));
    }

    #[tokio::test]
    async fn guard_hands_out_meter_and_shuts_down() {
        // Nothing listens on the endpoint; export only fails at send time.
        let config = TelemetryConfig {
            otlp_endpoint: Some("http://localhost:4317".to_string()),
            ..TelemetryConfig::default()
        };
        let guard = init_metrics(&config).unwrap();
        let _counter = guard.meter().u64_counter("corral.test.counter").build();
        guard.shutdown().unwrap();
    }
}
