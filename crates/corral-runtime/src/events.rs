//! Fire-and-forget notification bus.
//!
//! Events reach two kinds of consumers:
//!
//! - callback listeners registered with [`EventBus::on`], invoked inline on
//!   the publishing task. Each invocation is isolated with `catch_unwind`, so
//!   a panicking listener is logged and skipped without affecting the
//!   publisher or the other listeners.
//! - [`broadcast`] receivers from [`EventBus::subscribe`], for consumers that
//!   want to process events on their own task. Slow receivers lag and lose
//!   events; the publisher never waits for them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::orchestration::types::TaskStatus;

/// Broadcast channel buffer size.
const DEFAULT_CAPACITY: usize = 256;

/// Notification published by the registry and the supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskSpawned {
        task_id: String,
        parent_id: String,
        depth: u32,
        priority: u32,
    },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// The task reached a terminal state.
    TaskCompleted {
        task_id: String,
        parent_id: String,
        status: TaskStatus,
        duration_ms: u64,
    },
    SupervisorStarted {
        supervisor_id: String,
    },
    SupervisorStopped {
        supervisor_id: String,
    },
    ChildRestarted {
        supervisor_id: String,
        child_id: String,
        restart_count: u32,
    },
    ChildStopped {
        supervisor_id: String,
        child_id: String,
        reason: String,
    },
    /// Restart intensity was exceeded and the crash was forwarded upward.
    SupervisorEscalated {
        supervisor_id: String,
        child_id: String,
    },
    DegradedFallback {
        supervisor_id: String,
        child_id: String,
        succeeded: bool,
    },
}

impl Event {
    /// Stable topic name of the event.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TaskSpawned { .. } => "subagent:spawn",
            Self::TaskStatusChanged { .. } => "subagent:status",
            Self::TaskCompleted { .. } => "subagent:complete",
            Self::SupervisorStarted { .. } => "supervisor:start",
            Self::SupervisorStopped { .. } => "supervisor:stop",
            Self::ChildRestarted { .. } => "supervisor:restart",
            Self::ChildStopped { .. } => "supervisor:child-stopped",
            Self::SupervisorEscalated { .. } => "supervisor:escalate",
            Self::DegradedFallback { .. } => "supervisor:degraded",
        }
    }
}

/// Handle returned by [`EventBus::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Publish/subscribe bus with isolated listeners.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Create with the default channel capacity.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Register a callback invoked for every published event.
    pub fn on(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener and receiver.
    pub fn publish(&self, event: Event) {
        // Listeners run outside the lock so they may (un)register listeners.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = event.name(), "Event listener panicked; continuing");
            }
        }

        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started(id: &str) -> Event {
        Event::SupervisorStarted {
            supervisor_id: id.to_string(),
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let bus = EventBus::with_defaults();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.on(|_| panic!("listener bug"));
        let counter = Arc::clone(&seen);
        bus.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(started("root"));
        bus.publish(started("root"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn receivers_get_published_events() {
        let bus = EventBus::with_defaults();
        let mut rx = bus.subscribe();
        bus.publish(started("root"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "supervisor:start");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::with_defaults();
        bus.publish(started("nobody-listens"));
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::with_defaults();
        let id = bus.on(|_| {});
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(Event::TaskStatusChanged {
            task_id: "t-1".to_string(),
            from: TaskStatus::Queued,
            to: TaskStatus::Running,
        })
        .unwrap();
        assert_eq!(json["type"], "task_status_changed");
        assert_eq!(json["to"], "running");
    }
}
