//! Metrics sink abstraction.
//!
//! The runtime records counters, gauges and histograms through a
//! [`MetricsSink`]. [`NoopMetrics`] is the default; with the `metrics`
//! feature, [`OtelMetrics`] forwards to the meter of the pipeline built by
//! `corral_core::metrics::init_metrics`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

/// Metric names recorded by the runtime.
pub mod names {
    pub const TASKS_DISPATCHED: &str = "corral.subagent.dispatched";
    pub const TASKS_FINISHED: &str = "corral.subagent.finished";
    pub const TASK_DURATION_MS: &str = "corral.subagent.duration_ms";
    pub const GC_REMOVED: &str = "corral.subagent.gc_removed";
    pub const WATCHDOG_CANCELLED: &str = "corral.subagent.watchdog_cancelled";
    pub const POOL_SIZE: &str = "corral.scheduler.pool_size";
    pub const QUEUE_SIZE: &str = "corral.scheduler.queue_size";
    pub const CIRCUIT_OPENED: &str = "corral.scheduler.circuit_opened";
    pub const CIRCUIT_REJECTED: &str = "corral.scheduler.circuit_rejected";
    pub const CHILD_RESTARTS: &str = "corral.supervisor.restarts";
    pub const ESCALATIONS: &str = "corral.supervisor.escalations";
}

/// Metric labels as `(key, value)` pairs.
pub type Labels<'a> = &'a [(&'static str, String)];

/// Destination for runtime metrics. Implementations must be cheap; they are
/// called inline on scheduling paths.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, value: u64, labels: Labels<'_>);
    fn gauge(&self, name: &'static str, value: f64, labels: Labels<'_>);
    fn histogram(&self, name: &'static str, value: f64, labels: Labels<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _value: u64, _labels: Labels<'_>) {}
    fn gauge(&self, _name: &'static str, _value: f64, _labels: Labels<'_>) {}
    fn histogram(&self, _name: &'static str, _value: f64, _labels: Labels<'_>) {}
}

/// Wrapper used inside the runtime: a panicking sink is logged and ignored.
#[derive(Clone)]
pub(crate) struct Metrics(Arc<dyn MetricsSink>);

impl Metrics {
    pub(crate) fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self(sink)
    }

    pub(crate) fn increment(&self, name: &'static str, value: u64, labels: Labels<'_>) {
        self.guarded(name, || self.0.increment(name, value, labels));
    }

    pub(crate) fn gauge(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        self.guarded(name, || self.0.gauge(name, value, labels));
    }

    pub(crate) fn histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        self.guarded(name, || self.0.histogram(name, value, labels));
    }

    #[allow(clippy::unused_self)]
    fn guarded(&self, name: &'static str, record: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(record)).is_err() {
            warn!(metric = name, "Metrics sink panicked; sample dropped");
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self(Arc::new(NoopMetrics))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Metrics")
    }
}

#[cfg(feature = "metrics")]
pub use otel::OtelMetrics;

#[cfg(feature = "metrics")]
mod otel {
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};

    use opentelemetry::KeyValue;
    use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

    use corral_core::metrics::MetricsGuard;

    use super::{Labels, MetricsSink};

    /// Records runtime metrics as `OpenTelemetry` instruments, created lazily
    /// on first use of each name.
    pub struct OtelMetrics {
        meter: Meter,
        counters: Mutex<HashMap<&'static str, Counter<u64>>>,
        gauges: Mutex<HashMap<&'static str, Gauge<f64>>>,
        histograms: Mutex<HashMap<&'static str, Histogram<f64>>>,
    }

    impl OtelMetrics {
        pub fn new(meter: Meter) -> Self {
            Self {
                meter,
                counters: Mutex::new(HashMap::new()),
                gauges: Mutex::new(HashMap::new()),
                histograms: Mutex::new(HashMap::new()),
            }
        }

        /// Record through the OTLP pipeline owned by `guard`.
        pub fn from_guard(guard: &MetricsGuard) -> Self {
            Self::new(guard.meter())
        }
    }

    /// Falls back to the global meter provider.
    impl Default for OtelMetrics {
        fn default() -> Self {
            Self::new(opentelemetry::global::meter("corral"))
        }
    }

    impl std::fmt::Debug for OtelMetrics {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OtelMetrics").finish_non_exhaustive()
        }
    }

    fn attributes(labels: Labels<'_>) -> Vec<KeyValue> {
        labels
            .iter()
            .map(|(k, v)| KeyValue::new(*k, v.clone()))
            .collect()
    }

    impl MetricsSink for OtelMetrics {
        fn increment(&self, name: &'static str, value: u64, labels: Labels<'_>) {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters
                .entry(name)
                .or_insert_with(|| self.meter.u64_counter(name).build())
                .add(value, &attributes(labels));
        }

        fn gauge(&self, name: &'static str, value: f64, labels: Labels<'_>) {
            let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
            gauges
                .entry(name)
                .or_insert_with(|| self.meter.f64_gauge(name).build())
                .record(value, &attributes(labels));
        }

        fn histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
            let mut histograms = self
                .histograms
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            histograms
                .entry(name)
                .or_insert_with(|| self.meter.f64_histogram(name).build())
                .record(value, &attributes(labels));
        }
    }

    #[cfg(test)]
    #[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
    mod tests {
        use std::sync::Arc;

        use super::*;
        use crate::metrics::{Metrics, names};

        #[tokio::test]
        async fn records_through_guard_meter() {
            let config = corral_core::TelemetryConfig {
                otlp_endpoint: Some("http://localhost:4317".to_string()),
                ..corral_core::TelemetryConfig::default()
            };
            let guard = corral_core::metrics::init_metrics(&config).unwrap();
            let sink = Arc::new(OtelMetrics::from_guard(&guard));
            let metrics = Metrics::new(sink.clone());
            metrics.increment(names::TASKS_DISPATCHED, 1, &[("parent", "p".to_string())]);
            metrics.increment(names::TASKS_DISPATCHED, 1, &[]);
            metrics.gauge(names::POOL_SIZE, 4.0, &[]);
            metrics.histogram(names::TASK_DURATION_MS, 12.0, &[]);
            assert_eq!(sink.counters.lock().unwrap().len(), 1);
            assert_eq!(sink.gauges.lock().unwrap().len(), 1);
            assert_eq!(sink.histograms.lock().unwrap().len(), 1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Exploding;

    impl MetricsSink for Exploding {
        fn increment(&self, _: &'static str, _: u64, _: Labels<'_>) {
            panic!("sink bug");
        }
        fn gauge(&self, _: &'static str, _: f64, _: Labels<'_>) {
            panic!("sink bug");
        }
        fn histogram(&self, _: &'static str, _: f64, _: Labels<'_>) {
            panic!("sink bug");
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl MetricsSink for Counting {
        fn increment(&self, _: &'static str, value: u64, _: Labels<'_>) {
            self.0
                .fetch_add(usize::try_from(value).unwrap(), Ordering::SeqCst);
        }
        fn gauge(&self, _: &'static str, _: f64, _: Labels<'_>) {}
        fn histogram(&self, _: &'static str, _: f64, _: Labels<'_>) {}
    }

    #[test]
    fn panicking_sink_is_contained() {
        let metrics = Metrics::new(Arc::new(Exploding));
        metrics.increment(names::TASKS_DISPATCHED, 1, &[]);
        metrics.gauge(names::POOL_SIZE, 4.0, &[]);
        metrics.histogram(names::TASK_DURATION_MS, 12.0, &[]);
    }

    #[test]
    fn samples_reach_sink() {
        let sink = Arc::new(Counting::default());
        let metrics = Metrics::new(sink.clone());
        metrics.increment(names::TASKS_DISPATCHED, 2, &[("parent", "p".to_string())]);
        metrics.increment(names::TASKS_DISPATCHED, 1, &[]);
        assert_eq!(sink.0.load(Ordering::SeqCst), 3);
    }
}
