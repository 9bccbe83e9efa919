//! Child specifications and the supervisor's child table.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::node::{AgentNode, DegradedFallback, NodeFactory};

/// Whether a crashed child is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Always restarted.
    #[default]
    Permanent,
    /// Never restarted; a crash just stops it.
    Temporary,
    /// Restarted on crash. Every crash report counts as an abnormal exit.
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Running,
    Stopped,
}

impl ChildStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat probing for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// A probe that has not answered after this long counts as a crash.
    pub timeout: Duration,
}

/// Declaration of one supervised child.
#[derive(Clone)]
pub struct ChildSpec {
    pub id: String,
    pub policy: RestartPolicy,
    pub factory: Arc<dyn NodeFactory>,
    pub fallback: Option<Arc<dyn DegradedFallback>>,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl ChildSpec {
    /// A permanent child without fallback or heartbeat.
    pub fn new(id: impl Into<String>, factory: impl NodeFactory + 'static) -> Self {
        Self {
            id: id.into(),
            policy: RestartPolicy::Permanent,
            factory: Arc::new(factory),
            fallback: None,
            heartbeat: None,
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: impl DegradedFallback + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat = Some(HeartbeatConfig { interval, timeout });
        self
    }
}

impl fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSpec")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("fallback", &self.fallback.is_some())
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildState {
    pub id: String,
    pub policy: RestartPolicy,
    pub status: ChildStatus,
    /// Restarts performed over the child's lifetime.
    pub restart_count: u32,
    /// Restart timestamps still inside the intensity window.
    pub recent_restarts: usize,
}

/// Mutable per-child state. The status is derived from the live node, so a
/// running child always has one and a stopped child never does.
pub(crate) struct ChildRuntime {
    pub spec: ChildSpec,
    pub node: Option<Arc<dyn AgentNode>>,
    pub restart_timestamps: VecDeque<Instant>,
    pub restart_count: u32,
}

impl ChildRuntime {
    pub fn new(spec: ChildSpec) -> Self {
        Self {
            spec,
            node: None,
            restart_timestamps: VecDeque::new(),
            restart_count: 0,
        }
    }

    pub const fn status(&self) -> ChildStatus {
        if self.node.is_some() {
            ChildStatus::Running
        } else {
            ChildStatus::Stopped
        }
    }

    /// Record a restart at `now` and return how many fall inside `window`.
    pub fn record_restart(&mut self, now: Instant, window: Duration) -> usize {
        self.restart_timestamps.push_back(now);
        while let Some(oldest) = self.restart_timestamps.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.restart_timestamps.pop_front();
            } else {
                break;
            }
        }
        self.restart_timestamps.len()
    }

    pub fn state(&self) -> ChildState {
        ChildState {
            id: self.spec.id.clone(),
            policy: self.spec.policy,
            status: self.status(),
            restart_count: self.restart_count,
            recent_restarts: self.restart_timestamps.len(),
        }
    }
}

/// Where a supervisor is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Running,
    ShutDown,
}

/// Children in declaration order plus the supervisor's lifecycle and
/// heartbeat timers, all behind one lock.
pub(crate) struct ChildTable {
    pub children: Vec<ChildRuntime>,
    pub lifecycle: Lifecycle,
    pub heartbeats: Vec<AbortHandle>,
}

impl ChildTable {
    pub fn new(specs: Vec<ChildSpec>) -> Self {
        Self {
            children: specs.into_iter().map(ChildRuntime::new).collect(),
            lifecycle: Lifecycle::Idle,
            heartbeats: Vec::new(),
        }
    }

    pub fn index_of(&self, child_id: &str) -> Option<usize> {
        self.children.iter().position(|c| c.spec.id == child_id)
    }

    pub fn get(&self, child_id: &str) -> Option<&ChildRuntime> {
        self.children.iter().find(|c| c.spec.id == child_id)
    }

    pub fn abort_heartbeats(&mut self) {
        for timer in self.heartbeats.drain(..) {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::supervision::node::NodeError;

    struct Node;
    impl AgentNode for Node {}

    fn spec(id: &str) -> ChildSpec {
        ChildSpec::new(id, |_: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
            Ok(Arc::new(Node))
        })
    }

    #[test]
    fn status_follows_live_node() {
        let mut child = ChildRuntime::new(spec("a"));
        assert_eq!(child.status(), ChildStatus::Stopped);
        child.node = Some(Arc::new(Node));
        assert_eq!(child.status(), ChildStatus::Running);
    }

    #[test]
    fn restart_window_prunes_old_entries() {
        let mut child = ChildRuntime::new(spec("a"));
        let window = Duration::from_secs(10);
        let start = Instant::now();
        assert_eq!(child.record_restart(start, window), 1);
        assert_eq!(child.record_restart(start + Duration::from_secs(5), window), 2);
        assert_eq!(child.record_restart(start + Duration::from_secs(12), window), 2);
        assert_eq!(child.record_restart(start + Duration::from_secs(30), window), 1);
    }

    #[test]
    fn table_keeps_declaration_order() {
        let table = ChildTable::new(vec![spec("a"), spec("b"), spec("c")]);
        assert_eq!(table.index_of("b"), Some(1));
        assert_eq!(table.index_of("zzz"), None);
        assert_eq!(table.get("c").unwrap().state().status, ChildStatus::Stopped);
    }

    #[test]
    fn spec_defaults_to_permanent() {
        let s = spec("a").with_heartbeat(Duration::from_secs(1), Duration::from_millis(200));
        assert_eq!(s.policy, RestartPolicy::Permanent);
        assert!(s.heartbeat.is_some());
        assert!(s.fallback.is_none());
    }
}
