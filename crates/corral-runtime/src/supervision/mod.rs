//! Agent supervision tree.
//!
//! - [`AgentSupervisor`]: restarts crashed children per [`RestartStrategy`]
//!   within a restart-intensity budget, escalates or falls back beyond it,
//!   and probes children with heartbeats.
//! - [`SupervisorBuilder`]: fluent construction.
//! - [`node`]: the capabilities a supervisor consumes from its children.

pub mod builder;
pub mod child;
pub mod node;
pub mod supervisor;

pub use builder::SupervisorBuilder;
pub use child::{ChildSpec, ChildState, ChildStatus, HeartbeatConfig, RestartPolicy};
pub use node::{AgentNode, CrashReporter, DegradedFallback, HealthProbe, NodeError, NodeFactory};
pub use supervisor::{AgentSupervisor, CrashOutcome, RestartStrategy, SupervisorError};
