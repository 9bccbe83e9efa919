//! OTP-style supervisor for long-lived agent nodes.
//!
//! An [`AgentSupervisor`] owns a fixed, ordered set of children. When a child
//! crashes it is restarted together with its cohort (depending on the
//! [`RestartStrategy`]) as long as the child's restart intensity stays within
//! `max_restarts` per `window`. Past that, the cohort is stopped and the
//! crash is escalated to the parent supervisor, or, at the root of the tree,
//! the child's degraded fallback is invoked.
//!
//! Crash handling is serialized by a crash gate. The child table itself sits
//! behind a synchronous lock that is never held across an await, so
//! introspection never waits on a restart in progress.

use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventBus};
use crate::metrics::{Metrics, names};

use super::child::{ChildState, ChildStatus, ChildTable, HeartbeatConfig, Lifecycle, RestartPolicy};
use super::node::{AgentNode, CrashReporter, NodeError};

/// Which children are restarted together when one crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Only the crashed child.
    #[default]
    OneForOne,
    /// Every child, in declaration order.
    OneForAll,
    /// The crashed child and every child declared after it.
    RestForOne,
}

impl RestartStrategy {
    /// Indices restarted (or stopped) together with the child at `index`.
    pub const fn cohort(self, index: usize, len: usize) -> Range<usize> {
        match self {
            Self::OneForOne => index..index + 1,
            Self::OneForAll => 0..len,
            Self::RestForOne => index..len,
        }
    }
}

/// Errors from supervisor construction and startup.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor {supervisor_id} declares child {child_id} more than once")]
    DuplicateChild {
        supervisor_id: String,
        child_id: String,
    },

    #[error("Supervisor {supervisor_id} child {child_id} has a zero heartbeat interval")]
    InvalidHeartbeat {
        supervisor_id: String,
        child_id: String,
    },

    #[error("Failed to start child {child_id}: {source}")]
    Factory {
        child_id: String,
        #[source]
        source: NodeError,
    },

    #[error("Supervisor {supervisor_id} is already started")]
    AlreadyStarted { supervisor_id: String },

    #[error("Supervisor {supervisor_id} has been shut down")]
    ShutDown { supervisor_id: String },
}

/// What [`AgentSupervisor::handle_child_crash`] did with a crash report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashOutcome {
    /// Unknown child, child already stopped, or supervisor not running.
    Ignored,
    /// Temporary child: stopped without restart.
    Stopped,
    /// The listed children were restarted, in order. Children whose factory
    /// failed are missing from the list and left stopped.
    Restarted { children: Vec<String> },
    /// Intensity exceeded; the crash was forwarded to the parent.
    Escalated,
    /// Intensity exceeded at the root; the fallback ran.
    Degraded { succeeded: bool },
    /// Intensity exceeded at the root with no fallback declared.
    GaveUp,
}

enum Plan {
    Ignore,
    StopTemporary,
    Restart(Range<usize>),
    Exceeded(Range<usize>),
}

/// Supervisor owning an ordered set of child nodes.
pub struct AgentSupervisor {
    id: String,
    strategy: RestartStrategy,
    max_restarts: usize,
    window: Duration,
    table: RwLock<ChildTable>,
    crash_gate: Mutex<()>,
    events: Option<Arc<EventBus>>,
    parent: Option<Arc<dyn CrashReporter>>,
    metrics: Metrics,
}

impl AgentSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        strategy: RestartStrategy,
        max_restarts: usize,
        window: Duration,
        table: ChildTable,
        events: Option<Arc<EventBus>>,
        parent: Option<Arc<dyn CrashReporter>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            id,
            strategy,
            max_restarts,
            window,
            table: RwLock::new(table),
            crash_gate: Mutex::new(()),
            events,
            parent,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn strategy(&self) -> RestartStrategy {
        self.strategy
    }

    fn read(&self) -> RwLockReadGuard<'_, ChildTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChildTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create every child in declaration order and arm heartbeats.
    ///
    /// A factory failure aborts startup with [`SupervisorError::Factory`];
    /// children created before it stay running.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _gate = self.crash_gate.lock().await;

        let specs = {
            let mut table = self.write();
            match table.lifecycle {
                Lifecycle::Running => {
                    return Err(SupervisorError::AlreadyStarted {
                        supervisor_id: self.id.clone(),
                    });
                }
                Lifecycle::ShutDown => {
                    return Err(SupervisorError::ShutDown {
                        supervisor_id: self.id.clone(),
                    });
                }
                Lifecycle::Idle => table.lifecycle = Lifecycle::Running,
            }
            table
                .children
                .iter()
                .map(|c| (c.spec.id.clone(), Arc::clone(&c.spec.factory), c.spec.heartbeat))
                .collect::<Vec<_>>()
        };

        for (child_id, factory, _) in &specs {
            let node = match factory.create(child_id).await {
                Ok(node) => node,
                Err(source) => {
                    error!(supervisor_id = %self.id, child_id = %child_id, error = %source, "Child failed to start");
                    self.roll_back_start();
                    return Err(SupervisorError::Factory {
                        child_id: child_id.clone(),
                        source,
                    });
                }
            };
            {
                let mut table = self.write();
                if let Some(idx) = table.index_of(child_id) {
                    table.children[idx].node = Some(node);
                }
            }
            debug!(supervisor_id = %self.id, child_id = %child_id, "Child started");
        }

        let timers: Vec<_> = specs
            .into_iter()
            .filter_map(|(child_id, _, heartbeat)| {
                heartbeat.map(|config| self.spawn_heartbeat(child_id, config))
            })
            .collect();
        self.write().heartbeats.extend(timers);

        info!(supervisor_id = %self.id, strategy = ?self.strategy, "Supervisor started");
        self.publish(Event::SupervisorStarted {
            supervisor_id: self.id.clone(),
        });
        Ok(())
    }

    /// Undo a partial `start()`: stop the children created so far and return
    /// to idle so the call can be retried.
    fn roll_back_start(&self) {
        let dropped: Vec<Arc<dyn AgentNode>> = {
            let mut table = self.write();
            if table.lifecycle == Lifecycle::Running {
                table.lifecycle = Lifecycle::Idle;
            }
            table
                .children
                .iter_mut()
                .filter_map(|c| c.node.take())
                .collect()
        };
        drop(dropped);
        warn!(supervisor_id = %self.id, "Supervisor start rolled back");
    }

    /// Stop every child and the heartbeat timers. Idempotent.
    pub fn shutdown(&self) {
        let dropped: Vec<Arc<dyn AgentNode>> = {
            let mut table = self.write();
            if table.lifecycle == Lifecycle::ShutDown {
                return;
            }
            table.lifecycle = Lifecycle::ShutDown;
            table.abort_heartbeats();
            table
                .children
                .iter_mut()
                .filter_map(|c| c.node.take())
                .collect()
        };
        // Nodes are dropped outside the lock.
        drop(dropped);

        info!(supervisor_id = %self.id, "Supervisor shut down");
        self.publish(Event::SupervisorStopped {
            supervisor_id: self.id.clone(),
        });
    }

    /// React to a crash of `child_id` according to its policy, the restart
    /// intensity and the strategy.
    pub async fn handle_child_crash(&self, child_id: &str, error: NodeError) -> CrashOutcome {
        let gate = self.crash_gate.lock().await;

        let plan = {
            let mut table = self.write();
            self.plan(&mut table, child_id)
        };

        match plan {
            Plan::Ignore => CrashOutcome::Ignored,
            Plan::StopTemporary => {
                info!(supervisor_id = %self.id, child_id, error = %error, "Temporary child stopped");
                self.emit_stopped(child_id, &format!("crashed: {error}"));
                CrashOutcome::Stopped
            }
            Plan::Restart(cohort) => {
                warn!(supervisor_id = %self.id, child_id, error = %error, "Child crashed, restarting");
                let children = self.restart(cohort).await;
                drop(gate);
                CrashOutcome::Restarted { children }
            }
            Plan::Exceeded(cohort) => {
                let stopped = self.stop_cohort(cohort);
                drop(gate);
                error!(
                    supervisor_id = %self.id,
                    child_id,
                    error = %error,
                    max_restarts = self.max_restarts,
                    window = ?self.window,
                    "Restart intensity exceeded"
                );
                for id in &stopped {
                    self.emit_stopped(id, "restart intensity exceeded");
                }
                self.give_up(child_id, error).await
            }
        }
    }

    fn plan(&self, table: &mut ChildTable, child_id: &str) -> Plan {
        if table.lifecycle != Lifecycle::Running {
            debug!(supervisor_id = %self.id, child_id, "Crash report ignored, supervisor not running");
            return Plan::Ignore;
        }
        let Some(idx) = table.index_of(child_id) else {
            warn!(supervisor_id = %self.id, child_id, "Crash report for unknown child ignored");
            return Plan::Ignore;
        };
        let len = table.children.len();
        let child = &mut table.children[idx];
        if child.node.is_none() {
            debug!(supervisor_id = %self.id, child_id, "Crash report for stopped child ignored");
            return Plan::Ignore;
        }
        if child.spec.policy == RestartPolicy::Temporary {
            child.node = None;
            return Plan::StopTemporary;
        }

        let recent = child.record_restart(Instant::now(), self.window);
        let cohort = self.strategy.cohort(idx, len);
        if recent <= self.max_restarts {
            Plan::Restart(cohort)
        } else {
            Plan::Exceeded(cohort)
        }
    }

    /// Drop the cohort's nodes in reverse order, then recreate them in
    /// declaration order.
    async fn restart(&self, cohort: Range<usize>) -> Vec<String> {
        let targets: Vec<_> = {
            let mut table = self.write();
            for idx in cohort.clone().rev() {
                table.children[idx].node = None;
            }
            table.children[cohort]
                .iter()
                .map(|c| (c.spec.id.clone(), Arc::clone(&c.spec.factory)))
                .collect()
        };

        let mut restarted = Vec::with_capacity(targets.len());
        for (child_id, factory) in targets {
            match factory.create(&child_id).await {
                Ok(node) => {
                    let restart_count = {
                        let mut table = self.write();
                        if table.lifecycle != Lifecycle::Running {
                            debug!(supervisor_id = %self.id, child_id = %child_id, "Shut down during restart");
                            break;
                        }
                        let Some(idx) = table.index_of(&child_id) else {
                            continue;
                        };
                        let child = &mut table.children[idx];
                        child.node = Some(node);
                        child.restart_count += 1;
                        child.restart_count
                    };
                    info!(supervisor_id = %self.id, child_id = %child_id, restart_count, "Child restarted");
                    self.metrics.increment(
                        names::CHILD_RESTARTS,
                        1,
                        &[
                            ("supervisor", self.id.clone()),
                            ("child", child_id.clone()),
                        ],
                    );
                    self.publish(Event::ChildRestarted {
                        supervisor_id: self.id.clone(),
                        child_id: child_id.clone(),
                        restart_count,
                    });
                    restarted.push(child_id);
                }
                Err(e) => {
                    error!(supervisor_id = %self.id, child_id = %child_id, error = %e, "Child restart failed, leaving it stopped");
                    self.emit_stopped(&child_id, &format!("restart failed: {e}"));
                }
            }
        }
        restarted
    }

    /// Stop every running child in the cohort. Returns the ids stopped.
    fn stop_cohort(&self, cohort: Range<usize>) -> Vec<String> {
        let (stopped, nodes): (Vec<String>, Vec<Arc<dyn AgentNode>>) = {
            let mut table = self.write();
            table.children[cohort]
                .iter_mut()
                .rev()
                .filter_map(|c| c.node.take().map(|n| (c.spec.id.clone(), n)))
                .unzip()
        };
        drop(nodes);
        stopped.into_iter().rev().collect()
    }

    async fn give_up(&self, child_id: &str, error: NodeError) -> CrashOutcome {
        if let Some(parent) = &self.parent {
            warn!(supervisor_id = %self.id, child_id, "Escalating to parent supervisor");
            self.metrics.increment(
                names::ESCALATIONS,
                1,
                &[("supervisor", self.id.clone())],
            );
            self.publish(Event::SupervisorEscalated {
                supervisor_id: self.id.clone(),
                child_id: child_id.to_string(),
            });
            parent
                .report_crash(
                    &self.id,
                    NodeError::Escalated {
                        supervisor_id: self.id.clone(),
                        child_id: child_id.to_string(),
                        cause: Box::new(error),
                    },
                )
                .await;
            return CrashOutcome::Escalated;
        }

        let fallback = self
            .read()
            .get(child_id)
            .and_then(|c| c.spec.fallback.clone());
        let Some(fallback) = fallback else {
            warn!(supervisor_id = %self.id, child_id, "No parent or fallback; child stays stopped");
            return CrashOutcome::GaveUp;
        };

        let succeeded = match fallback.activate(child_id, &error).await {
            Ok(()) => {
                info!(supervisor_id = %self.id, child_id, "Degraded fallback activated");
                true
            }
            Err(e) => {
                warn!(supervisor_id = %self.id, child_id, error = %e, "Degraded fallback failed");
                false
            }
        };
        self.publish(Event::DegradedFallback {
            supervisor_id: self.id.clone(),
            child_id: child_id.to_string(),
            succeeded,
        });
        CrashOutcome::Degraded { succeeded }
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        child_id: String,
        config: HeartbeatConfig,
    ) -> tokio::task::AbortHandle {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(config.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the first immediate tick
            timer.tick().await;

            loop {
                timer.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                let Some(node) = supervisor.live_node(&child_id) else {
                    continue;
                };
                let Some(probe) = node.health_probe() else {
                    continue;
                };

                let failure = match tokio::time::timeout(config.timeout, probe.ping()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(_) => NodeError::ProbeTimeout {
                        after: config.timeout,
                    },
                };

                // A restart may have replaced the node while we were probing.
                let same_node = supervisor
                    .live_node(&child_id)
                    .is_some_and(|current| Arc::ptr_eq(&current, &node));
                if same_node {
                    warn!(
                        supervisor_id = %supervisor.id,
                        child_id = %child_id,
                        error = %failure,
                        "Heartbeat failed"
                    );
                    supervisor.handle_child_crash(&child_id, failure).await;
                }
            }
        })
        .abort_handle()
    }

    pub fn child_state(&self, child_id: &str) -> Option<ChildState> {
        self.read().get(child_id).map(super::child::ChildRuntime::state)
    }

    /// Status of every child, in declaration order.
    pub fn children_status(&self) -> Vec<(String, ChildStatus)> {
        self.read()
            .children
            .iter()
            .map(|c| (c.spec.id.clone(), c.status()))
            .collect()
    }

    /// The child's current node, `None` while it is stopped.
    pub fn live_node(&self, child_id: &str) -> Option<Arc<dyn AgentNode>> {
        self.read().get(child_id).and_then(|c| c.node.clone())
    }

    pub fn is_running(&self) -> bool {
        self.read().lifecycle == Lifecycle::Running
    }

    fn emit_stopped(&self, child_id: &str, reason: &str) {
        self.publish(Event::ChildStopped {
            supervisor_id: self.id.clone(),
            child_id: child_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

#[async_trait]
impl CrashReporter for AgentSupervisor {
    async fn report_crash(&self, child_id: &str, error: NodeError) {
        self.handle_child_crash(child_id, error).await;
    }
}

/// A supervisor can itself be the live node of a parent's child.
impl AgentNode for AgentSupervisor {}

impl Drop for AgentSupervisor {
    fn drop(&mut self) {
        self.table
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_heartbeats();
    }
}

impl std::fmt::Debug for AgentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSupervisor")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("max_restarts", &self.max_restarts)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
