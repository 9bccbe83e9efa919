//! Fluent assembly of an [`AgentSupervisor`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use corral_core::SupervisorConfig;

use crate::events::EventBus;
use crate::metrics::{Metrics, MetricsSink};

use super::child::{ChildSpec, ChildTable};
use super::node::CrashReporter;
use super::supervisor::{AgentSupervisor, RestartStrategy, SupervisorError};

/// Builder for [`AgentSupervisor`].
///
/// ```ignore
/// let supervisor = SupervisorBuilder::new("tools")
///     .strategy(RestartStrategy::RestForOne)
///     .intensity(2, Duration::from_secs(10))
///     .child(ChildSpec::new("indexer", make_indexer))
///     .child(ChildSpec::new("search", make_search))
///     .build()?;
/// supervisor.start().await?;
/// ```
#[derive(Default)]
pub struct SupervisorBuilder {
    id: String,
    strategy: RestartStrategy,
    config: SupervisorConfig,
    children: Vec<ChildSpec>,
    events: Option<Arc<EventBus>>,
    parent: Option<Arc<dyn CrashReporter>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl SupervisorBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn strategy(mut self, strategy: RestartStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// At most `max_restarts` restarts per child within `window`.
    #[must_use]
    pub fn intensity(mut self, max_restarts: usize, window: Duration) -> Self {
        self.config.max_restarts = max_restarts;
        self.config.window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Take restart intensity from configuration.
    #[must_use]
    pub fn with_config(mut self, config: &SupervisorConfig) -> Self {
        self.config = config.clone();
        self
    }

    #[must_use]
    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    #[must_use]
    pub fn children(mut self, specs: impl IntoIterator<Item = ChildSpec>) -> Self {
        self.children.extend(specs);
        self
    }

    #[must_use]
    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Escalate exhausted crashes to `parent` instead of running fallbacks.
    #[must_use]
    pub fn parent(mut self, parent: Arc<dyn CrashReporter>) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arc<AgentSupervisor>, SupervisorError> {
        let mut seen = HashSet::new();
        for spec in &self.children {
            if !seen.insert(spec.id.as_str()) {
                return Err(SupervisorError::DuplicateChild {
                    supervisor_id: self.id,
                    child_id: spec.id.clone(),
                });
            }
            if spec.heartbeat.is_some_and(|hb| hb.interval.is_zero()) {
                return Err(SupervisorError::InvalidHeartbeat {
                    supervisor_id: self.id,
                    child_id: spec.id.clone(),
                });
            }
        }

        Ok(Arc::new(AgentSupervisor::new(
            self.id,
            self.strategy,
            self.config.max_restarts,
            self.config.window(),
            ChildTable::new(self.children),
            self.events,
            self.parent,
            self.metrics.map(Metrics::new).unwrap_or_default(),
        )))
    }
}

impl std::fmt::Debug for SupervisorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorBuilder")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("config", &self.config)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
