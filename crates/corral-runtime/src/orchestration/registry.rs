//! Task registry: the single owner of subagent task handles.
//!
//! Every status change goes through [`TaskRegistry::transition`] (or one of
//! the operations built on it), which enforces the state machine in
//! [`TaskStatus::can_transition_to`]. Entering a terminal state aborts the
//! timeout timer, wakes waiters and emits the completion event exactly once,
//! no matter whether completion, timeout, watchdog or a cascading cancel got
//! there first.
//!
//! Events and metrics produced while the state lock is held are buffered and
//! flushed after it is released, so listeners may call back into the
//! registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use corral_core::ResourceLimits;
use tokio::sync::{RwLock, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::metrics::{Metrics, MetricsSink, names};

use super::types::{
    DEFAULT_PRIORITY, DispatchParams, TaskError, TaskSnapshot, TaskStatus, TokenUsage,
    TransitionData,
};

/// GC sweeps every terminal handle once the table holds more than
/// `max_concurrent_global` times this factor.
const GC_PRESSURE_FACTOR: usize = 10;

/// Watchdog cancels running handles older than their timeout times this.
const WATCHDOG_FACTOR: u32 = 2;

/// Shortest period the GC loop runs at; smaller intervals are raised to it.
const MIN_GC_INTERVAL: Duration = Duration::from_millis(1);

/// Reasons a dispatch is refused. Nothing is created when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Delegation depth {depth} reaches the limit of {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("Parent {parent_id} already has {active} active subagents (limit {limit})")]
    QuotaExceeded {
        parent_id: String,
        active: usize,
        limit: usize,
    },

    #[error("Task queue is full ({limit} queued)")]
    QueueFull { limit: usize },
}

/// Result of a cancel request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cancellation {
    /// Handles cancelled directly by the request.
    pub direct: usize,
    /// Every handle cancelled, cascades included, in cancellation order.
    pub task_ids: Vec<String>,
}

/// Summary of one garbage-collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Terminal handles removed from the table.
    pub removed: usize,
    /// Running handles force-cancelled by the watchdog.
    pub watchdog_cancelled: usize,
    /// Whether table pressure forced a sweep of every terminal handle.
    pub forced: bool,
}

/// What a worker needs to run a task it has claimed.
#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    pub task_id: String,
    pub prompt: String,
    pub instructions: String,
    pub task_type: String,
    pub timeout: Duration,
    pub token: CancellationToken,
}

/// State of a queued id as seen by the scheduler's drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The handle no longer exists.
    Gone,
    /// The handle moved on from `queued`.
    NotQueued,
    /// The handle is queued but its token has fired.
    Cancelled,
    Queued { task_type: String },
}

struct TaskHandle {
    task_id: String,
    parent_id: String,
    depth: u32,
    status: TaskStatus,
    priority: u32,
    task_type: String,
    prompt: String,
    instructions: String,
    partial_output: String,
    final_output: Option<String>,
    error: Option<TaskError>,
    timeout: Duration,
    token_usage: TokenUsage,
    metadata: serde_json::Map<String, serde_json::Value>,
    created_at: Instant,
    status_changed_at: Instant,
    started_at: Option<Instant>,
    token: CancellationToken,
    timer: Option<AbortHandle>,
    done: watch::Sender<bool>,
}

impl TaskHandle {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            parent_id: self.parent_id.clone(),
            depth: self.depth,
            status: self.status,
            priority: self.priority,
            task_type: self.task_type.clone(),
            prompt: self.prompt.clone(),
            instructions: self.instructions.clone(),
            partial_output: self.partial_output.clone(),
            final_output: self.final_output.clone(),
            error: self.error.clone(),
            timeout: self.timeout,
            token_usage: self.token_usage,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            status_changed_at: self.status_changed_at,
            started_at: self.started_at,
        }
    }

    /// Apply one state-machine edge. Returns `false` when the edge is not
    /// allowed, in which case nothing changes.
    fn apply(
        &mut self,
        next: TaskStatus,
        data: TransitionData,
        now: Instant,
        effects: &mut Effects,
    ) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let from = self.status;
        self.status = next;
        self.status_changed_at = now;
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if let Some(usage) = data.token_usage {
            self.token_usage = usage;
        }
        if data.final_output.is_some() {
            self.final_output = data.final_output;
        }
        if data.error.is_some() {
            self.error = data.error;
        }

        effects.events.push(Event::TaskStatusChanged {
            task_id: self.task_id.clone(),
            from,
            to: next,
        });

        if next.is_terminal() {
            if let Some(timer) = self.timer.take() {
                timer.abort();
            }
            self.token.cancel();
            let duration = now.saturating_duration_since(self.started_at.unwrap_or(self.created_at));
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            effects.events.push(Event::TaskCompleted {
                task_id: self.task_id.clone(),
                parent_id: self.parent_id.clone(),
                status: next,
                duration_ms,
            });
            effects.finished.push(Finished {
                status: next,
                task_type: self.task_type.clone(),
                duration,
            });
            self.done.send_replace(true);
        }
        true
    }
}

struct Finished {
    status: TaskStatus,
    task_type: String,
    duration: Duration,
}

/// Side effects collected under the state lock.
#[derive(Default)]
struct Effects {
    events: Vec<Event>,
    finished: Vec<Finished>,
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<String, TaskHandle>,
    /// Child ids per parent, in dispatch order.
    by_parent: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn active_children(&self, parent_id: &str) -> usize {
        self.by_parent.get(parent_id).map_or(0, |ids| {
            ids.iter()
                .filter(|id| self.handles.get(*id).is_some_and(|h| !h.status.is_terminal()))
                .count()
        })
    }

    fn queued_count(&self) -> usize {
        self.handles
            .values()
            .filter(|h| h.status == TaskStatus::Queued)
            .count()
    }

    fn remove(&mut self, task_id: &str) -> bool {
        let Some(handle) = self.handles.remove(task_id) else {
            return false;
        };
        if let Some(ids) = self.by_parent.get_mut(&handle.parent_id) {
            ids.retain(|id| id != task_id);
            if ids.is_empty() {
                self.by_parent.remove(&handle.parent_id);
            }
        }
        true
    }

    /// Cancel each root and, depth-first, every non-terminal descendant.
    fn cancel_cascade(
        &mut self,
        roots: Vec<(String, TaskError)>,
        now: Instant,
        effects: &mut Effects,
    ) -> Cancellation {
        let mut result = Cancellation::default();
        for (root_id, root_error) in roots {
            let mut stack = vec![(root_id, root_error, true)];
            while let Some((task_id, error, is_root)) = stack.pop() {
                let Some(handle) = self.handles.get_mut(&task_id) else {
                    continue;
                };
                if handle.status.is_terminal() {
                    continue;
                }
                handle.token.cancel();
                let reason = error.message.clone();
                if !handle.apply(TaskStatus::Cancelled, TransitionData::error(error), now, effects)
                {
                    continue;
                }
                debug!(task_id = %task_id, reason = %reason, "Subagent cancelled");
                if is_root {
                    result.direct += 1;
                }

                if let Some(children) = self.by_parent.get(&task_id) {
                    let child_reason = format!("parent-cancelled:{reason}");
                    for child in children.iter().rev() {
                        if self
                            .handles
                            .get(child)
                            .is_some_and(|h| !h.status.is_terminal())
                        {
                            stack.push((child.clone(), TaskError::cancelled(&child_reason), false));
                        }
                    }
                }
                result.task_ids.push(task_id);
            }
        }
        result
    }
}

/// Owns every subagent task handle and enforces the dispatch limits.
pub struct TaskRegistry {
    limits: ResourceLimits,
    state: RwLock<RegistryState>,
    ids: Arc<dyn IdGenerator>,
    events: Option<Arc<EventBus>>,
    metrics: Metrics,
}

impl TaskRegistry {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            state: RwLock::new(RegistryState::default()),
            ids: Arc::new(UuidGenerator),
            events: None,
            metrics: Metrics::default(),
        }
    }

    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Metrics::new(sink);
        self
    }

    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Create a `queued` handle for `parent_id`.
    ///
    /// `current_depth` is the depth of the dispatching parent; the new task
    /// lives one level deeper. Enqueueing the returned id is the caller's
    /// job.
    pub async fn dispatch(
        &self,
        parent_id: &str,
        current_depth: u32,
        params: DispatchParams,
    ) -> Result<TaskSnapshot, DispatchError> {
        if current_depth >= self.limits.max_depth {
            return Err(DispatchError::DepthExceeded {
                depth: current_depth,
                max_depth: self.limits.max_depth,
            });
        }

        let snapshot = {
            let mut state = self.state.write().await;

            let active = state.active_children(parent_id);
            if active >= self.limits.max_concurrent_per_parent {
                return Err(DispatchError::QuotaExceeded {
                    parent_id: parent_id.to_string(),
                    active,
                    limit: self.limits.max_concurrent_per_parent,
                });
            }
            if state.queued_count() >= self.limits.max_queue_size {
                return Err(DispatchError::QueueFull {
                    limit: self.limits.max_queue_size,
                });
            }

            let now = Instant::now();
            let task_id = self.ids.next_id();
            let task_type = params
                .task_type
                .unwrap_or_else(|| params.instructions.clone());
            let (done, _) = watch::channel(false);
            let handle = TaskHandle {
                task_id: task_id.clone(),
                parent_id: parent_id.to_string(),
                depth: current_depth + 1,
                status: TaskStatus::Queued,
                priority: params.priority.unwrap_or(DEFAULT_PRIORITY),
                task_type,
                prompt: params.prompt,
                instructions: params.instructions,
                partial_output: String::new(),
                final_output: None,
                error: None,
                timeout: self.limits.clamp_timeout(params.timeout),
                token_usage: TokenUsage::default(),
                metadata: params.metadata,
                created_at: now,
                status_changed_at: now,
                started_at: None,
                token: CancellationToken::new(),
                timer: None,
                done,
            };
            let snapshot = handle.snapshot();
            state.handles.insert(task_id.clone(), handle);
            state
                .by_parent
                .entry(parent_id.to_string())
                .or_default()
                .push(task_id);
            snapshot
        };

        info!(
            task_id = %snapshot.task_id,
            parent_id,
            depth = snapshot.depth,
            priority = snapshot.priority,
            "Subagent dispatched"
        );
        self.publish(Event::TaskSpawned {
            task_id: snapshot.task_id.clone(),
            parent_id: parent_id.to_string(),
            depth: snapshot.depth,
            priority: snapshot.priority,
        });
        self.metrics.increment(
            names::TASKS_DISPATCHED,
            1,
            &[("task_type", snapshot.task_type.clone())],
        );
        Ok(snapshot)
    }

    /// Move a handle along one edge of the state machine.
    ///
    /// Returns `false` without side effects if the handle is missing, already
    /// terminal, or the edge is not allowed.
    pub async fn transition(&self, task_id: &str, next: TaskStatus, data: TransitionData) -> bool {
        let mut effects = Effects::default();
        let applied = {
            let mut state = self.state.write().await;
            state
                .handles
                .get_mut(task_id)
                .is_some_and(|h| h.apply(next, data, Instant::now(), &mut effects))
        };
        if applied {
            debug!(task_id, status = %next, "Subagent status changed");
        }
        self.flush(effects);
        applied
    }

    /// Claim a queued task for execution, moving it to `running`.
    pub(crate) async fn start(&self, task_id: &str) -> Option<RunTicket> {
        let mut effects = Effects::default();
        let ticket = {
            let mut state = self.state.write().await;
            let handle = state.handles.get_mut(task_id)?;
            if handle.status != TaskStatus::Queued || handle.token.is_cancelled() {
                return None;
            }
            handle.apply(
                TaskStatus::Running,
                TransitionData::default(),
                Instant::now(),
                &mut effects,
            );
            RunTicket {
                task_id: handle.task_id.clone(),
                prompt: handle.prompt.clone(),
                instructions: handle.instructions.clone(),
                task_type: handle.task_type.clone(),
                timeout: handle.timeout,
                token: handle.token.clone(),
            }
        };
        debug!(task_id, "Subagent running");
        self.flush(effects);
        Some(ticket)
    }

    pub(crate) async fn admission(&self, task_id: &str) -> Admission {
        let state = self.state.read().await;
        match state.handles.get(task_id) {
            None => Admission::Gone,
            Some(h) if h.status != TaskStatus::Queued => Admission::NotQueued,
            Some(h) if h.token.is_cancelled() => Admission::Cancelled,
            Some(h) => Admission::Queued {
                task_type: h.task_type.clone(),
            },
        }
    }

    /// Attach the timeout timer of a running task so a terminal transition
    /// can abort it. A timer for an already-finished task is aborted at once.
    pub(crate) async fn attach_timer(&self, task_id: &str, timer: AbortHandle) {
        let mut state = self.state.write().await;
        match state.handles.get_mut(task_id) {
            Some(handle) if !handle.status.is_terminal() => {
                if let Some(previous) = handle.timer.replace(timer) {
                    previous.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// Append streamed output. The first chunk moves `running` to `streaming`.
    pub async fn record_progress(&self, task_id: &str, chunk: &str, usage: TokenUsage) -> bool {
        let mut effects = Effects::default();
        let recorded = {
            let mut state = self.state.write().await;
            match state.handles.get_mut(task_id) {
                Some(handle) if !handle.status.is_terminal() => {
                    if handle.status == TaskStatus::Running {
                        handle.apply(
                            TaskStatus::Streaming,
                            TransitionData::default(),
                            Instant::now(),
                            &mut effects,
                        );
                    }
                    if handle.status == TaskStatus::Streaming {
                        handle.partial_output.push_str(chunk);
                        handle.token_usage.accumulate(usage);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        self.flush(effects);
        recorded
    }

    /// Cancel one task and cascade to its non-terminal descendants.
    ///
    /// Returns `false` when the task is unknown or already terminal.
    pub async fn cancel(&self, task_id: &str, reason: &str) -> bool {
        self.cancel_tree(task_id, reason).await.direct > 0
    }

    /// Like [`cancel`](Self::cancel) but reports every id that was cancelled.
    pub async fn cancel_tree(&self, task_id: &str, reason: &str) -> Cancellation {
        self.cancel_roots(vec![(task_id.to_string(), TaskError::cancelled(reason))])
            .await
    }

    /// Cancel every non-terminal task owned by `parent_id`.
    pub async fn cancel_all(&self, parent_id: &str, reason: &str) -> Cancellation {
        let roots = {
            let state = self.state.read().await;
            state
                .by_parent
                .get(parent_id)
                .map(|ids| {
                    ids.iter()
                        .map(|id| (id.clone(), TaskError::cancelled(reason)))
                        .collect()
                })
                .unwrap_or_default()
        };
        self.cancel_roots(roots).await
    }

    /// Cancel every non-terminal task in the registry.
    pub async fn cancel_everything(&self, reason: &str) -> Cancellation {
        let roots = {
            let state = self.state.read().await;
            state
                .handles
                .values()
                .filter(|h| !h.status.is_terminal())
                .map(|h| (h.task_id.clone(), TaskError::cancelled(reason)))
                .collect()
        };
        self.cancel_roots(roots).await
    }

    async fn cancel_roots(&self, roots: Vec<(String, TaskError)>) -> Cancellation {
        if roots.is_empty() {
            return Cancellation::default();
        }
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.write().await;
            state.cancel_cascade(roots, Instant::now(), &mut effects)
        };
        self.flush(effects);
        result
    }

    /// Wait until the task is terminal or `timeout` elapses.
    ///
    /// On timeout the current (non-terminal) snapshot is returned. `None`
    /// only when the id is unknown.
    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Option<TaskSnapshot> {
        let mut done = {
            let state = self.state.read().await;
            let handle = state.handles.get(task_id)?;
            if handle.status.is_terminal() {
                return Some(handle.snapshot());
            }
            handle.done.subscribe()
        };

        let finished = tokio::time::timeout(timeout, async {
            done.wait_for(|finished| *finished).await.is_ok()
        })
        .await;
        if finished.is_err() {
            debug!(task_id, ?timeout, "Wait for subagent timed out");
        }
        self.get(task_id).await
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.state
            .read()
            .await
            .handles
            .get(task_id)
            .map(TaskHandle::snapshot)
    }

    /// Snapshots of every task dispatched by `parent_id`, in dispatch order.
    pub async fn get_by_parent(&self, parent_id: &str) -> Vec<TaskSnapshot> {
        let state = self.state.read().await;
        state
            .by_parent
            .get(parent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.handles.get(id).map(TaskHandle::snapshot))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.handles.is_empty()
    }

    /// Run one garbage-collection and watchdog sweep.
    ///
    /// 1. Running handles older than twice their timeout are cancelled.
    /// 2. Terminal handles idle for longer than the GC TTL are removed.
    /// 3. If the table still holds more than ten times the global
    ///    concurrency limit, every terminal handle is removed.
    pub async fn gc(&self) -> GcReport {
        let now = Instant::now();
        let ttl = self.limits.gc_ttl();
        let mut effects = Effects::default();
        let mut report = GcReport::default();

        {
            let mut state = self.state.write().await;

            let stuck: Vec<(String, TaskError)> = state
                .handles
                .values()
                .filter(|h| matches!(h.status, TaskStatus::Running | TaskStatus::Streaming))
                .filter(|h| {
                    let started = h.started_at.unwrap_or(h.created_at);
                    now.saturating_duration_since(started) > h.timeout * WATCHDOG_FACTOR
                })
                .map(|h| (h.task_id.clone(), TaskError::watchdog()))
                .collect();
            if !stuck.is_empty() {
                for (task_id, _) in &stuck {
                    warn!(task_id = %task_id, "Watchdog cancelling stuck subagent");
                }
                report.watchdog_cancelled = state.cancel_cascade(stuck, now, &mut effects).direct;
            }

            let expired: Vec<String> = state
                .handles
                .values()
                .filter(|h| {
                    h.status.is_terminal() && now.saturating_duration_since(h.status_changed_at) > ttl
                })
                .map(|h| h.task_id.clone())
                .collect();
            for task_id in &expired {
                if state.remove(task_id) {
                    report.removed += 1;
                }
            }

            let pressure_limit = self.limits.max_concurrent_global * GC_PRESSURE_FACTOR;
            if state.handles.len() > pressure_limit {
                report.forced = true;
                let terminal: Vec<String> = state
                    .handles
                    .values()
                    .filter(|h| h.status.is_terminal())
                    .map(|h| h.task_id.clone())
                    .collect();
                for task_id in &terminal {
                    if state.remove(task_id) {
                        report.removed += 1;
                    }
                }
            }
        }

        self.flush(effects);

        if report.removed > 0 || report.watchdog_cancelled > 0 || report.forced {
            info!(
                removed = report.removed,
                watchdog_cancelled = report.watchdog_cancelled,
                forced = report.forced,
                "Subagent GC sweep"
            );
        } else {
            debug!("Subagent GC sweep found nothing to do");
        }
        if report.removed > 0 {
            self.metrics
                .increment(names::GC_REMOVED, report.removed as u64, &[]);
        }
        if report.watchdog_cancelled > 0 {
            self.metrics.increment(
                names::WATCHDOG_CANCELLED,
                report.watchdog_cancelled as u64,
                &[],
            );
        }
        report
    }

    /// Run [`gc`](Self::gc) every `gc_interval` until `shutdown` fires.
    pub fn spawn_gc_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut period = registry.limits.gc_interval();
        if period < MIN_GC_INTERVAL {
            warn!(
                requested = ?period,
                clamped = ?MIN_GC_INTERVAL,
                "GC interval too small; clamping"
            );
            period = MIN_GC_INTERVAL;
        }
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the first immediate tick
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        registry.gc().await;
                    }
                    () = shutdown.cancelled() => {
                        debug!("Subagent GC loop shutting down");
                        return;
                    }
                }
            }
        })
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn flush(&self, effects: Effects) {
        for finished in effects.finished {
            let labels = [
                ("status", finished.status.as_str().to_string()),
                ("task_type", finished.task_type),
            ];
            self.metrics.increment(names::TASKS_FINISHED, 1, &labels);
            #[allow(clippy::cast_precision_loss)]
            self.metrics.histogram(
                names::TASK_DURATION_MS,
                finished.duration.as_millis() as f64,
                &labels,
            );
        }
        for event in effects.events {
            self.publish(event);
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
