//! Corral runtime library
//!
//! Resilient concurrent execution for agent orchestration:
//! - Subagent task registry with quotas, cascading cancellation and GC
//! - Aging priority scheduler with an auto-scaling worker pool and
//!   per-task-type circuit breakers
//! - OTP-style supervision tree for long-lived agent nodes
//! - Event bus and metrics sink shared by both

pub mod events;
pub mod ids;
pub mod metrics;
pub mod orchestration;
pub mod supervision;

pub use events::{Event, EventBus, ListenerId};
pub use ids::{IdGenerator, SequentialIds, UuidGenerator};
pub use metrics::{MetricsSink, NoopMetrics};
#[cfg(feature = "metrics")]
pub use metrics::OtelMetrics;
pub use orchestration::{DispatchParams, Executor, ManagerOptions, SubagentManager, TaskStatus};
pub use supervision::{AgentSupervisor, ChildSpec, RestartStrategy, SupervisorBuilder};
