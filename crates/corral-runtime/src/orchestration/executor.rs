//! The execution capability the scheduler drives.
//!
//! Everything that actually does work for a subagent (prompting a model,
//! running tools) lives behind [`Executor`]. The scheduler hands it a request
//! and the task's cancellation token; the executor reports streaming output
//! through the [`ProgressReporter`] in the request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::registry::TaskRegistry;
use super::types::TokenUsage;

/// Everything an executor needs to run one subagent task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub prompt: String,
    pub instructions: String,
    /// Step budget for the executor's own loop.
    pub max_steps: u32,
    pub progress: ProgressReporter,
}

/// Successful result of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub text: String,
    /// Totals for the whole run. Replaces whatever progress chunks reported.
    pub token_usage: TokenUsage,
}

impl ExecutionOutput {
    pub fn new(text: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            token_usage,
        }
    }
}

/// Errors returned by executors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("step budget of {max_steps} exhausted")]
    StepLimit { max_steps: u32 },

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Runs subagent tasks. Must honor the token cooperatively; the scheduler
/// also stops waiting on the returned future once the token fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// Streams partial output of one task back into the registry.
#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<TaskRegistry>,
    task_id: String,
}

impl ProgressReporter {
    pub(crate) const fn new(registry: Arc<TaskRegistry>, task_id: String) -> Self {
        Self { registry, task_id }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Append a chunk of output. The first chunk moves the task to
    /// `streaming`. Returns `false` once the task has finished.
    pub async fn chunk(&self, text: &str, usage: TokenUsage) -> bool {
        self.registry
            .record_progress(&self.task_id, text, usage)
            .await
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}
