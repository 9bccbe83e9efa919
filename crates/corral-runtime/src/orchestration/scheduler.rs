//! Priority scheduler that feeds queued subagent tasks to the executor.
//!
//! The [`TaskScheduler`] owns the aging priority queue, the auto-scaling
//! worker pool and the per-task-type circuit breaker. A single drain loop,
//! woken through a [`Notify`] after every enqueue and every worker
//! completion, pulls ids off the queue while worker slots are free and
//! spawns one worker per task.
//!
//! The scheduler never owns task state. It reads and transitions handles
//! through the [`TaskRegistry`]; the registry never calls back into the
//! scheduler.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corral_core::{CircuitBreakerConfig, SchedulerConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{Metrics, MetricsSink, names};

use super::circuit::{CircuitBreaker, CircuitState};
use super::executor::{
    ExecutionError, ExecutionOutput, ExecutionRequest, Executor, ProgressReporter,
};
use super::pool::WorkerPool;
use super::queue::TaskQueue;
use super::registry::{Admission, RunTicket, TaskRegistry};
use super::types::{TaskError, TaskErrorKind, TaskStatus, TransitionData};

struct SchedulerState {
    queue: TaskQueue,
    pool: WorkerPool,
    breaker: CircuitBreaker,
}

/// How a worker's run ended, as far as the breaker is concerned.
enum Verdict {
    Success,
    Failure,
    /// Cancelled or otherwise ended without judging the task type.
    Interrupted,
}

/// Drains the task queue into executor workers.
pub struct TaskScheduler {
    registry: Arc<TaskRegistry>,
    executor: Arc<dyn Executor>,
    state: Mutex<SchedulerState>,
    notify: Notify,
    max_steps: u32,
    metrics: Metrics,
}

impl TaskScheduler {
    /// Build a scheduler over `registry`. The pool is capped at the
    /// registry's global concurrency limit.
    pub fn new(
        registry: Arc<TaskRegistry>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let limits = registry.limits();
        let max_steps = limits.max_steps_per_task;
        let queue = TaskQueue::new(config.aging_interval());
        let pool = WorkerPool::new(config, limits.max_concurrent_global);
        Self {
            registry,
            executor,
            state: Mutex::new(SchedulerState {
                queue,
                pool,
                breaker: CircuitBreaker::new(breaker),
            }),
            notify: Notify::new(),
            max_steps,
            metrics: Metrics::default(),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Metrics::new(sink);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a dispatched task and wake the drain loop.
    pub fn enqueue(&self, task_id: &str, priority: u32) {
        let queued = {
            let mut state = self.lock();
            if state.queue.contains(task_id) {
                debug!(task_id, "Subagent already queued");
                return;
            }
            state.queue.enqueue(task_id, priority, Instant::now());
            state.queue.len()
        };
        debug!(task_id, priority, queued, "Subagent enqueued");
        self.record_queue_size(queued);
        self.notify.notify_one();
    }

    /// Drop a still-queued task. Returns `false` if it was not queued.
    pub fn remove(&self, task_id: &str) -> bool {
        let (removed, queued) = {
            let mut state = self.lock();
            let removed = state.queue.remove(task_id).is_some();
            (removed, state.queue.len())
        };
        if removed {
            self.record_queue_size(queued);
        }
        removed
    }

    pub fn active_workers(&self) -> usize {
        self.lock().pool.active()
    }

    pub fn pool_size(&self) -> usize {
        self.lock().pool.size()
    }

    pub fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn circuit_state(&self, task_type: &str) -> CircuitState {
        self.lock().breaker.state(task_type)
    }

    /// Task types the breaker currently tracks.
    pub fn tracked_circuits(&self) -> usize {
        self.lock().breaker.tracked()
    }

    /// Spawn the drain loop. It runs until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(shutdown).await })
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Task scheduler started");
        loop {
            self.drain().await;
            tokio::select! {
                () = self.notify.notified() => {}
                () = shutdown.cancelled() => {
                    info!("Task scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Start workers for queued tasks until the queue is empty or every
    /// worker slot is taken.
    pub async fn drain(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.queue.is_empty() {
                    break;
                }
                if !state.pool.try_acquire() {
                    if let Some(resize) = state.pool.maybe_resize(Instant::now()) {
                        debug!(
                            ?resize,
                            queued = state.queue.len(),
                            head_priority = ?state.queue.peek_effective_priority(),
                            "Pool resized while saturated"
                        );
                    }
                    if !state.pool.try_acquire() {
                        break;
                    }
                }
                let entry = state.queue.dequeue(Instant::now());
                if entry.is_none() {
                    state.pool.release();
                }
                entry.map(|e| (e, state.queue.len(), state.pool.size()))
            };
            let Some((entry, queued, pool_size)) = next else {
                break;
            };
            self.record_queue_size(queued);
            self.record_pool_size(pool_size);

            let task_id = entry.task_id;
            match self.registry.admission(&task_id).await {
                Admission::Gone | Admission::NotQueued => {
                    debug!(task_id = %task_id, "Skipping stale queue entry");
                    self.release_slot();
                }
                Admission::Cancelled => {
                    self.registry
                        .transition(
                            &task_id,
                            TaskStatus::Cancelled,
                            TransitionData::error(TaskError::cancelled("cancelled")),
                        )
                        .await;
                    self.release_slot();
                }
                Admission::Queued { task_type } => {
                    let admitted = self.lock().breaker.try_acquire(&task_type, Instant::now());
                    if let Err(open) = admitted {
                        warn!(task_id = %task_id, task_type = %task_type, "Circuit open, failing subagent");
                        self.metrics.increment(
                            names::CIRCUIT_REJECTED,
                            1,
                            &[("task_type", task_type.clone())],
                        );
                        self.reject(&task_id, &open.task_type).await;
                        self.release_slot();
                    } else {
                        let scheduler = Arc::clone(self);
                        tokio::spawn(async move { scheduler.work(task_id, task_type).await });
                    }
                }
            }
        }
    }

    /// Fail a task whose circuit is open without invoking the executor.
    async fn reject(&self, task_id: &str, task_type: &str) {
        if self.registry.start(task_id).await.is_some() {
            self.registry
                .transition(
                    task_id,
                    TaskStatus::Failed,
                    TransitionData::error(TaskError::circuit_open(task_type)),
                )
                .await;
        }
    }

    async fn work(self: Arc<Self>, task_id: String, task_type: String) {
        let verdict = match self.registry.start(&task_id).await {
            Some(ticket) => self.execute(ticket).await,
            None => Verdict::Interrupted,
        };

        {
            let mut state = self.lock();
            match verdict {
                Verdict::Success => state.breaker.record_success(&task_type),
                Verdict::Failure => {
                    if state.breaker.record_failure(&task_type, Instant::now()) {
                        self.metrics.increment(
                            names::CIRCUIT_OPENED,
                            1,
                            &[("task_type", task_type.clone())],
                        );
                    }
                }
                Verdict::Interrupted => state.breaker.release_trial(&task_type),
            }
            let forgotten = state.breaker.sweep(Instant::now());
            if forgotten > 0 {
                debug!(forgotten, "Dropped idle circuits");
            }
        }

        self.release_slot();
        self.notify.notify_one();
    }

    async fn execute(&self, ticket: RunTicket) -> Verdict {
        let RunTicket {
            task_id,
            prompt,
            instructions,
            task_type: _,
            timeout,
            token,
        } = ticket;

        let timer = {
            let registry = Arc::clone(&self.registry);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if registry
                    .transition(
                        &task_id,
                        TaskStatus::Timeout,
                        TransitionData::error(TaskError::timeout(timeout)),
                    )
                    .await
                {
                    warn!(task_id = %task_id, ?timeout, "Subagent timed out");
                }
            })
        };
        self.registry
            .attach_timer(&task_id, timer.abort_handle())
            .await;

        let request = ExecutionRequest {
            task_id: task_id.clone(),
            prompt,
            instructions,
            max_steps: self.max_steps,
            progress: ProgressReporter::new(Arc::clone(&self.registry), task_id.clone()),
        };
        let executor = Arc::clone(&self.executor);
        let exec_token = token.clone();
        let mut run = tokio::spawn(async move { executor.execute(request, exec_token).await });

        let joined = tokio::select! {
            biased;
            () = token.cancelled() => {
                run.abort();
                None
            }
            joined = &mut run => Some(joined),
        };

        let outcome = match joined {
            None => return self.interrupted(&task_id).await,
            Some(Ok(result)) => result,
            Some(Err(join_error)) if join_error.is_panic() => {
                error!(task_id = %task_id, "Executor panicked");
                Err(ExecutionError::failed("executor panicked"))
            }
            Some(Err(_)) => return self.interrupted(&task_id).await,
        };

        match outcome {
            Ok(ExecutionOutput { text, token_usage }) => {
                let applied = self
                    .registry
                    .transition(
                        &task_id,
                        TaskStatus::Completed,
                        TransitionData::output(text, token_usage),
                    )
                    .await;
                if applied {
                    info!(task_id = %task_id, "Subagent completed");
                    Verdict::Success
                } else {
                    self.interrupted(&task_id).await
                }
            }
            Err(_) if token.is_cancelled() => self.interrupted(&task_id).await,
            Err(e) => {
                let applied = self
                    .registry
                    .transition(
                        &task_id,
                        TaskStatus::Failed,
                        TransitionData::error(TaskError::new(
                            TaskErrorKind::Execution,
                            e.to_string(),
                        )),
                    )
                    .await;
                if applied {
                    warn!(task_id = %task_id, error = %e, "Subagent failed");
                    Verdict::Failure
                } else {
                    self.interrupted(&task_id).await
                }
            }
        }
    }

    /// The run ended because something else finished the task. A timeout
    /// counts against the task type; a cancellation does not.
    async fn interrupted(&self, task_id: &str) -> Verdict {
        match self.registry.get(task_id).await.map(|s| s.status) {
            Some(TaskStatus::Timeout) => Verdict::Failure,
            _ => Verdict::Interrupted,
        }
    }

    fn release_slot(&self) {
        let pool_size = {
            let mut state = self.lock();
            state.pool.release();
            state.pool.maybe_resize(Instant::now());
            state.pool.size()
        };
        self.record_pool_size(pool_size);
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_queue_size(&self, queued: usize) {
        self.metrics.gauge(names::QUEUE_SIZE, queued as f64, &[]);
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_pool_size(&self, size: usize) {
        self.metrics.gauge(names::POOL_SIZE, size as f64, &[]);
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}
