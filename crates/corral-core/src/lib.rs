//! Corral Core Library
//!
//! Shared functionality for Corral components:
//! - Resource limits and scheduler/supervisor configuration
//! - Configuration resolution and hierarchy
//! - Tracing and `OpenTelemetry` initialisation
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::{
    CircuitBreakerConfig, Config, ResourceLimits, SchedulerConfig, SupervisorConfig,
    TelemetryConfig,
};
pub use error::{Error, Result};
