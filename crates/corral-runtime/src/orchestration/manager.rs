//! Subagent lifecycle manager.
//!
//! [`SubagentManager`] is the high-level coordinator that:
//! - builds the [`TaskRegistry`] and the [`TaskScheduler`] over it
//! - hands every accepted dispatch to the scheduler queue
//! - owns the drain loop and the GC/watchdog loop
//! - cancels outstanding subagents on shutdown

use std::sync::Arc;
use std::time::Duration;

use corral_core::{CircuitBreakerConfig, Config, ResourceLimits, SchedulerConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::EventBus;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::metrics::{MetricsSink, NoopMetrics};

use super::circuit::CircuitState;
use super::executor::Executor;
use super::registry::{DispatchError, GcReport, TaskRegistry};
use super::scheduler::TaskScheduler;
use super::types::{DispatchParams, TaskSnapshot};

/// Reason recorded on tasks cancelled by [`SubagentManager::shutdown`].
const SHUTDOWN_REASON: &str = "shutdown";

/// Everything needed to assemble a [`SubagentManager`].
#[derive(Clone)]
pub struct ManagerOptions {
    pub limits: ResourceLimits,
    pub scheduler: SchedulerConfig,
    pub breaker: CircuitBreakerConfig,
    pub ids: Arc<dyn IdGenerator>,
    pub events: Option<Arc<EventBus>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits.clone(),
            scheduler: config.scheduler.clone(),
            breaker: config.breaker.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            scheduler: SchedulerConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            ids: Arc::new(UuidGenerator),
            events: None,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl std::fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("limits", &self.limits)
            .field("scheduler", &self.scheduler)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

/// Background loops started by [`SubagentManager::start`].
struct Loops {
    shutdown: CancellationToken,
    scheduler: JoinHandle<()>,
    gc: JoinHandle<()>,
}

/// High-level subagent lifecycle manager.
pub struct SubagentManager {
    registry: Arc<TaskRegistry>,
    scheduler: Arc<TaskScheduler>,
    loops: Mutex<Option<Loops>>,
}

impl SubagentManager {
    /// Build the registry, then the scheduler over it.
    pub fn new(executor: Arc<dyn Executor>, options: ManagerOptions) -> Self {
        let ManagerOptions {
            limits,
            scheduler,
            breaker,
            ids,
            events,
            metrics,
        } = options;

        let mut registry = TaskRegistry::new(limits)
            .with_id_generator(ids)
            .with_metrics(Arc::clone(&metrics));
        if let Some(events) = events {
            registry = registry.with_events(events);
        }
        let registry = Arc::new(registry);

        let scheduler = Arc::new(
            TaskScheduler::new(Arc::clone(&registry), executor, scheduler, breaker)
                .with_metrics(metrics),
        );

        Self {
            registry,
            scheduler,
            loops: Mutex::new(None),
        }
    }

    /// Spawn the drain loop and the GC loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        *loops = Some(Loops {
            scheduler: self.scheduler.spawn(shutdown.child_token()),
            gc: self.registry.spawn_gc_loop(shutdown.child_token()),
            shutdown,
        });
        drop(loops);
        info!("Subagent manager started");
    }

    /// Cancel every outstanding subagent and stop the background loops.
    pub async fn shutdown(&self) {
        let cancelled = self.registry.cancel_everything(SHUTDOWN_REASON).await;
        for task_id in &cancelled.task_ids {
            self.scheduler.remove(task_id);
        }

        let loops = self.loops.lock().await.take();
        if let Some(loops) = loops {
            loops.shutdown.cancel();
            for (name, handle) in [("scheduler", loops.scheduler), ("gc", loops.gc)] {
                if let Err(e) = handle.await {
                    warn!(loop_name = name, error = %e, "Background loop ended abnormally");
                }
            }
        }
        info!(cancelled = cancelled.task_ids.len(), "Subagent manager shut down");
    }

    /// Validate and register a subagent, then queue it for execution.
    pub async fn dispatch(
        &self,
        parent_id: &str,
        current_depth: u32,
        params: DispatchParams,
    ) -> Result<TaskSnapshot, DispatchError> {
        let snapshot = self
            .registry
            .dispatch(parent_id, current_depth, params)
            .await?;
        self.scheduler.enqueue(&snapshot.task_id, snapshot.priority);
        Ok(snapshot)
    }

    /// Cancel a subagent and its descendants. Returns `false` if the task is
    /// unknown or already finished.
    pub async fn cancel(&self, task_id: &str, reason: &str) -> bool {
        let cancelled = self.registry.cancel_tree(task_id, reason).await;
        for id in &cancelled.task_ids {
            self.scheduler.remove(id);
        }
        cancelled.direct > 0
    }

    /// Cancel every subagent owned by `parent_id`. Returns how many were
    /// cancelled directly.
    pub async fn cancel_all(&self, parent_id: &str, reason: &str) -> usize {
        let cancelled = self.registry.cancel_all(parent_id, reason).await;
        for id in &cancelled.task_ids {
            self.scheduler.remove(id);
        }
        cancelled.direct
    }

    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Option<TaskSnapshot> {
        self.registry.wait_for_completion(task_id, timeout).await
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.registry.get(task_id).await
    }

    pub async fn get_by_parent(&self, parent_id: &str) -> Vec<TaskSnapshot> {
        self.registry.get_by_parent(parent_id).await
    }

    /// Run a GC sweep now instead of waiting for the loop.
    pub async fn gc(&self) -> GcReport {
        self.registry.gc().await
    }

    pub fn active_workers(&self) -> usize {
        self.scheduler.active_workers()
    }

    pub fn pool_size(&self) -> usize {
        self.scheduler.pool_size()
    }

    pub fn queue_size(&self) -> usize {
        self.scheduler.queue_size()
    }

    pub fn circuit_state(&self, task_type: &str) -> CircuitState {
        self.scheduler.circuit_state(task_type)
    }

    pub const fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for SubagentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentManager")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
