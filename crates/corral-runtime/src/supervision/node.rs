//! Capabilities a supervisor consumes from the nodes it manages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Failure of a node, its factory, its health probe or its fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("{0}")]
    Failed(String),

    #[error("health probe did not answer within {after:?}")]
    ProbeTimeout { after: Duration },

    /// Restart intensity of a child supervisor was exceeded.
    #[error("supervisor {supervisor_id} gave up on child {child_id}: {cause}")]
    Escalated {
        supervisor_id: String,
        child_id: String,
        cause: Box<NodeError>,
    },
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A long-lived node managed by a supervisor.
///
/// Nodes are opaque to the supervisor. A node that wants heartbeat
/// monitoring exposes a [`HealthProbe`]; nodes without one are never probed.
pub trait AgentNode: Send + Sync + 'static {
    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        None
    }
}

/// Liveness check for a node.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self) -> Result<(), NodeError>;
}

/// Creates (and re-creates) the live node of a child.
#[async_trait]
pub trait NodeFactory: Send + Sync {
    async fn create(&self, child_id: &str) -> Result<Arc<dyn AgentNode>, NodeError>;
}

#[async_trait]
impl<F> NodeFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn AgentNode>, NodeError> + Send + Sync,
{
    async fn create(&self, child_id: &str) -> Result<Arc<dyn AgentNode>, NodeError> {
        self(child_id)
    }
}

/// Best-effort substitute invoked when a child is given up on and there is
/// no parent supervisor to escalate to.
#[async_trait]
pub trait DegradedFallback: Send + Sync {
    async fn activate(&self, child_id: &str, error: &NodeError) -> Result<(), NodeError>;
}

#[async_trait]
impl<F> DegradedFallback for F
where
    F: Fn(&str, &NodeError) -> Result<(), NodeError> + Send + Sync,
{
    async fn activate(&self, child_id: &str, error: &NodeError) -> Result<(), NodeError> {
        self(child_id, error)
    }
}

/// Receives crash reports. Implemented by `AgentSupervisor` so a child
/// supervisor can escalate to its parent.
#[async_trait]
pub trait CrashReporter: Send + Sync {
    async fn report_crash(&self, child_id: &str, error: NodeError);
}
