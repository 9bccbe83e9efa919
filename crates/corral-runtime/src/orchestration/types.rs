//! Subagent task types shared by the registry, scheduler and manager.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Priority assigned when a dispatch does not specify one.
pub const DEFAULT_PRIORITY: u32 = 5;

/// Lifecycle state of a subagent task.
///
/// ```text
/// queued ──► running ──► streaming ──► completed | failed | timeout | cancelled
///    │          └──────────────────────► completed | failed | timeout | cancelled
///    └─► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Streaming,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                next,
                Self::Streaming | Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
            ),
            Self::Streaming => matches!(
                next,
                Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
            ),
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counters reported by the executor. Recorded, never interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn accumulate(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Why a task ended in a non-successful terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The executor returned an error.
    Execution,
    /// The task type's circuit was open; the executor was never invoked.
    CircuitOpen,
    /// The clamped timeout elapsed.
    Timeout,
    /// Explicit or cascaded cancellation.
    Cancelled,
    /// Force-cancelled by the GC sweep after running past twice its timeout.
    Watchdog,
}

/// Error recorded on a terminal handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn circuit_open(task_type: &str) -> Self {
        Self::new(
            TaskErrorKind::CircuitOpen,
            format!("circuit open for task type '{task_type}'"),
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TaskErrorKind::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    pub fn cancelled(reason: &str) -> Self {
        Self::new(TaskErrorKind::Cancelled, reason)
    }

    pub fn watchdog() -> Self {
        Self::new(TaskErrorKind::Watchdog, "watchdog-timeout")
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Caller-supplied description of a subagent to dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchParams {
    pub prompt: String,
    pub instructions: String,
    /// Circuit-breaker key. Defaults to `instructions`.
    pub task_type: Option<String>,
    /// Lower is more urgent. Defaults to [`DEFAULT_PRIORITY`].
    pub priority: Option<u32>,
    /// Clamped to the configured maximum. Defaults to the configured default.
    pub timeout: Option<Duration>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DispatchParams {
    pub fn new(prompt: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            instructions: instructions.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Point-in-time copy of a task handle.
///
/// The registry owns the live handle; everything outside it works with ids
/// and snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub parent_id: String,
    pub depth: u32,
    pub status: TaskStatus,
    pub priority: u32,
    pub task_type: String,
    pub prompt: String,
    pub instructions: String,
    pub partial_output: String,
    pub final_output: Option<String>,
    pub error: Option<TaskError>,
    #[serde(serialize_with = "serialize_millis")]
    pub timeout: Duration,
    pub token_usage: TokenUsage,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub status_changed_at: Instant,
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

impl TaskSnapshot {
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Payload applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionData {
    pub final_output: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub error: Option<TaskError>,
}

impl TransitionData {
    pub fn output(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            final_output: Some(text.into()),
            token_usage: Some(usage),
            error: None,
        }
    }

    pub fn error(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 7] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Streaming,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn queued_only_starts_or_cancels() {
        let allowed: Vec<_> = ALL
            .into_iter()
            .filter(|s| TaskStatus::Queued.can_transition_to(*s))
            .collect();
        assert_eq!(allowed, vec![TaskStatus::Running, TaskStatus::Cancelled]);
    }

    #[test]
    fn streaming_cannot_go_back_to_running() {
        assert!(!TaskStatus::Streaming.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Streaming));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap_or_default();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn token_usage_accumulates_saturating() {
        let mut usage = TokenUsage::new(u64::MAX - 1, 3);
        usage.accumulate(TokenUsage::new(5, 4));
        assert_eq!(usage, TokenUsage::new(u64::MAX, 7));
    }
}
