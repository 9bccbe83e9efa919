//! Subagent orchestration: task registry, priority scheduler and manager.
//!
//! - [`TaskRegistry`]: owns task handles, enforces dispatch limits, drives
//!   the task state machine, cascades cancellation and garbage-collects.
//! - [`TaskScheduler`]: aging priority queue, auto-scaling worker pool and
//!   per-task-type circuit breaker in front of the [`Executor`].
//! - [`SubagentManager`]: wires the two together and owns their loops.

pub mod circuit;
pub mod executor;
pub mod manager;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use circuit::{CircuitBreaker, CircuitOpen, CircuitState};
pub use executor::{ExecutionError, ExecutionOutput, ExecutionRequest, Executor, ProgressReporter};
pub use manager::{ManagerOptions, SubagentManager};
pub use pool::WorkerPool;
pub use queue::TaskQueue;
pub use registry::{Cancellation, DispatchError, GcReport, TaskRegistry};
pub use scheduler::TaskScheduler;
pub use types::{
    DispatchParams, TaskError, TaskErrorKind, TaskSnapshot, TaskStatus, TokenUsage, TransitionData,
};
