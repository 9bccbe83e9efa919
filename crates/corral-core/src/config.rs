//! Configuration resolution for Corral.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/corral/settings.json)
//! 3. Project config (.corral/settings.json)
//! 4. Environment variables (highest priority)
//!
//! Files may be partial. Each layer is deep-merged over the previous one
//! before deserialization, so a project file that only sets
//! `limits.max_depth` keeps every other value from the layers below it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete Corral configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub limits: ResourceLimits,
    pub scheduler: SchedulerConfig,
    pub breaker: CircuitBreakerConfig,
    pub supervisor: SupervisorConfig,
    pub telemetry: TelemetryConfig,
    pub log_level: LogLevel,
}

/// Default log filter, kept as a newtype so it can carry a serde default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

/// Process-wide resource limits for subagent dispatch.
///
/// Read-only once a runtime has been built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Non-terminal subagents a single parent may own at once.
    pub max_concurrent_per_parent: usize,
    /// Upper bound of the worker pool; also scales the GC pressure threshold.
    pub max_concurrent_global: usize,
    /// Maximum delegation depth. A dispatch at `depth >= max_depth` is rejected.
    pub max_depth: u32,
    /// Timeout applied when a dispatch does not specify one.
    pub default_timeout_ms: u64,
    /// Requested timeouts are clamped to this value.
    pub max_timeout_ms: u64,
    /// Maximum number of handles in `queued` state.
    pub max_queue_size: usize,
    /// How long terminal handles stay retrievable.
    pub gc_ttl_ms: u64,
    /// Period of the GC / watchdog sweep.
    pub gc_interval_ms: u64,
    /// Step budget forwarded to the executor.
    pub max_steps_per_task: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_per_parent: 5,
            max_concurrent_global: 20,
            max_depth: 3,
            default_timeout_ms: 5 * 60 * 1000, // 5 minutes
            max_timeout_ms: 10 * 60 * 1000,    // 10 minutes
            max_queue_size: 100,
            gc_ttl_ms: 5 * 60 * 1000,
            gc_interval_ms: 30 * 1000,
            max_steps_per_task: 50,
        }
    }
}

impl ResourceLimits {
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub const fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub const fn gc_ttl(&self) -> Duration {
        Duration::from_millis(self.gc_ttl_ms)
    }

    pub const fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Resolve the effective timeout for a dispatch.
    ///
    /// `None` selects the default; explicit values are clamped to
    /// `[0, max_timeout]`.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or_else(|| self.default_timeout())
            .min(self.max_timeout())
    }
}

/// Worker pool sizing and queue aging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pool size when the scheduler starts.
    pub initial_pool_size: usize,
    /// The pool never shrinks below this.
    pub min_pool_size: usize,
    /// Every elapsed interval lowers a queued entry's effective priority by one.
    pub aging_interval_ms: u64,
    /// Utilization above which the pool grows by 50%.
    pub scale_up_threshold: f64,
    /// Utilization below which the pool shrinks by 25%.
    pub scale_down_threshold: f64,
    /// Minimum time between two resize decisions.
    pub scale_cooldown_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_pool_size: 4,
            min_pool_size: 1,
            aging_interval_ms: 5_000,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_cooldown_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub const fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }

    pub const fn scale_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_cooldown_ms)
    }
}

/// Per-task-type circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the monitor window that open the circuit.
    pub failure_threshold: usize,
    pub monitor_window_ms: u64,
    /// Time an open circuit waits before admitting a half-open trial.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            monitor_window_ms: 60_000,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub const fn monitor_window(&self) -> Duration {
        Duration::from_millis(self.monitor_window_ms)
    }

    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Default restart intensity for supervisors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: usize,
    pub window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// OTLP export settings, used when the `metrics` feature is enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP gRPC receiver. `None` leaves export disabled.
    pub otlp_endpoint: Option<String>,
    /// Reported as the `service.name` resource attribute.
    pub service_name: String,
    pub export_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "corral".to_string(),
            export_interval_ms: 60_000,
        }
    }
}

impl TelemetryConfig {
    pub const fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }
}

impl Config {
    /// `EnvFilter` directive applying `log_level` to the Corral crates.
    pub fn log_filter(&self) -> String {
        let level = &self.log_level.0;
        format!("corral_core={level},corral_runtime={level}")
    }

    /// Reject configurations that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_concurrent_global == 0 {
            return Err(Error::Config(
                "limits.max_concurrent_global must be at least 1".to_string(),
            ));
        }
        if limits.max_concurrent_per_parent == 0 {
            return Err(Error::Config(
                "limits.max_concurrent_per_parent must be at least 1".to_string(),
            ));
        }
        if limits.default_timeout_ms > limits.max_timeout_ms {
            return Err(Error::Config(format!(
                "limits.default_timeout_ms ({}) exceeds limits.max_timeout_ms ({})",
                limits.default_timeout_ms, limits.max_timeout_ms
            )));
        }
        if limits.gc_interval_ms == 0 {
            return Err(Error::Config(
                "limits.gc_interval_ms must be non-zero".to_string(),
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.min_pool_size == 0 {
            return Err(Error::Config(
                "scheduler.min_pool_size must be at least 1".to_string(),
            ));
        }
        if scheduler.min_pool_size > limits.max_concurrent_global {
            return Err(Error::Config(format!(
                "scheduler.min_pool_size ({}) exceeds limits.max_concurrent_global ({})",
                scheduler.min_pool_size, limits.max_concurrent_global
            )));
        }
        if scheduler.aging_interval_ms == 0 {
            return Err(Error::Config(
                "scheduler.aging_interval_ms must be non-zero".to_string(),
            ));
        }
        if scheduler.scale_down_threshold >= scheduler.scale_up_threshold {
            return Err(Error::Config(
                "scheduler.scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }

        if self.telemetry.export_interval_ms == 0 {
            return Err(Error::Config(
                "telemetry.export_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(|dir| dir.join(".corral").join("settings.json"));
    let mut config = load_layers(global.as_deref(), project.as_deref())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Merge the given config files (missing files are skipped) over the defaults.
pub fn load_layers(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    for path in [global, project].into_iter().flatten() {
        if path.exists() {
            let overlay = load_config_file(path)?;
            merge_json(&mut merged, overlay);
        }
    }

    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".corral").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/corral/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("corral").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively merge `overlay` into `base`; objects merge key by key,
/// everything else is replaced.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `CORRAL_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        lookup(key).and_then(|v| v.parse().ok())
    }

    if let Some(n) = parsed(&lookup, "CORRAL_MAX_CONCURRENT_PER_PARENT") {
        config.limits.max_concurrent_per_parent = n;
    }
    if let Some(n) = parsed(&lookup, "CORRAL_MAX_CONCURRENT_GLOBAL") {
        config.limits.max_concurrent_global = n;
    }
    if let Some(n) = parsed(&lookup, "CORRAL_MAX_DEPTH") {
        config.limits.max_depth = n;
    }
    if let Some(n) = parsed(&lookup, "CORRAL_MAX_QUEUE_SIZE") {
        config.limits.max_queue_size = n;
    }
    if let Some(n) = parsed(&lookup, "CORRAL_DEFAULT_TIMEOUT_MS") {
        config.limits.default_timeout_ms = n;
    }
    if let Some(n) = parsed(&lookup, "CORRAL_GC_TTL_MS") {
        config.limits.gc_ttl_ms = n;
    }
    if let Some(val) = lookup("CORRAL_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(val);
    }
    if let Some(val) = lookup("CORRAL_LOG_LEVEL") {
        config.log_level = LogLevel(val);
    }
}
