#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the supervision tree: restart strategies, restart
//! intensity, escalation, degraded fallbacks and heartbeats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corral_runtime::events::{Event, EventBus};
use corral_runtime::supervision::{
    AgentNode, AgentSupervisor, ChildSpec, ChildStatus, CrashOutcome, CrashReporter, HealthProbe,
    NodeError, RestartPolicy, RestartStrategy, SupervisorBuilder, SupervisorError,
};

#[derive(Clone, Copy)]
enum Health {
    Healthy,
    Unhealthy,
    Hangs,
}

struct TestNode {
    probe: Option<Health>,
}

impl TestNode {
    fn shared(probe: Option<Health>) -> Arc<dyn AgentNode> {
        Arc::new(Self { probe })
    }
}

#[async_trait]
impl HealthProbe for TestNode {
    async fn ping(&self) -> Result<(), NodeError> {
        match self.probe {
            Some(Health::Unhealthy) => Err(NodeError::failed("degraded")),
            Some(Health::Hangs) => std::future::pending().await,
            _ => Ok(()),
        }
    }
}

impl AgentNode for TestNode {
    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        self.probe.as_ref().map(|_| self as &dyn HealthProbe)
    }
}

/// Records the id of every node created, across all children.
#[derive(Clone, Default)]
struct CreationLog(Arc<Mutex<Vec<String>>>);

impl CreationLog {
    fn spec(&self, id: &str) -> ChildSpec {
        let log = self.clone();
        ChildSpec::new(id, move |child_id: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
            log.0.lock().unwrap().push(child_id.to_string());
            Ok(TestNode::shared(None))
        })
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Factory whose first node has `first` health and later nodes are healthy.
fn probed_child(id: &str, first: Health, created: Arc<AtomicUsize>) -> ChildSpec {
    ChildSpec::new(id, move |_: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
        let health = if created.fetch_add(1, Ordering::SeqCst) == 0 {
            first
        } else {
            Health::Healthy
        };
        Ok(TestNode::shared(Some(health)))
    })
    .with_heartbeat(Duration::from_secs(1), Duration::from_millis(200))
}

/// Healthy node that counts every heartbeat it answers.
struct CountingNode {
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl HealthProbe for CountingNode {
    async fn ping(&self) -> Result<(), NodeError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AgentNode for CountingNode {
    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        Some(self)
    }
}

#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<(String, NodeError)>>,
}

#[async_trait]
impl CrashReporter for RecordingReporter {
    async fn report_crash(&self, child_id: &str, error: NodeError) {
        self.reports
            .lock()
            .unwrap()
            .push((child_id.to_string(), error));
    }
}

fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<Event>>>) {
    let bus = Arc::new(EventBus::with_defaults());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.on(move |e| sink.lock().unwrap().push(e.clone()));
    (bus, events)
}

fn crash() -> NodeError {
    NodeError::failed("boom")
}

async fn started(builder: SupervisorBuilder) -> Arc<AgentSupervisor> {
    let supervisor = builder.build().unwrap();
    supervisor.start().await.unwrap();
    supervisor
}

#[tokio::test]
async fn strategies_restart_the_expected_cohort() {
    let cases = [
        (RestartStrategy::OneForOne, vec!["b"]),
        (RestartStrategy::OneForAll, vec!["a", "b", "c"]),
        (RestartStrategy::RestForOne, vec!["b", "c"]),
    ];

    for (strategy, expected) in cases {
        let log = CreationLog::default();
        let supervisor = started(
            SupervisorBuilder::new("root")
                .strategy(strategy)
                .children([log.spec("a"), log.spec("b"), log.spec("c")]),
        )
        .await;
        assert_eq!(log.take(), vec!["a", "b", "c"]);

        let outcome = supervisor.handle_child_crash("b", crash()).await;
        assert_eq!(
            outcome,
            CrashOutcome::Restarted {
                children: expected.iter().map(ToString::to_string).collect()
            },
            "{strategy:?}"
        );
        assert_eq!(log.take(), expected, "{strategy:?}");
        assert!(
            supervisor
                .children_status()
                .iter()
                .all(|(_, status)| *status == ChildStatus::Running)
        );
    }
}

#[tokio::test]
async fn third_crash_within_window_exceeds_intensity() {
    let (bus, events) = recording_bus();
    let log = CreationLog::default();
    let supervisor = started(
        SupervisorBuilder::new("root")
            .intensity(2, Duration::from_secs(10))
            .child(log.spec("a"))
            .event_bus(bus),
    )
    .await;

    for _ in 0..2 {
        assert!(matches!(
            supervisor.handle_child_crash("a", crash()).await,
            CrashOutcome::Restarted { .. }
        ));
    }
    assert_eq!(
        supervisor.handle_child_crash("a", crash()).await,
        CrashOutcome::GaveUp
    );

    let state = supervisor.child_state("a").unwrap();
    assert_eq!(state.status, ChildStatus::Stopped);
    assert_eq!(state.restart_count, 2);
    assert!(supervisor.live_node("a").is_none());
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        Event::ChildStopped { child_id, reason, .. }
            if child_id == "a" && reason == "restart intensity exceeded"
    )));

    // A stopped child no longer reacts to crash reports.
    assert_eq!(
        supervisor.handle_child_crash("a", crash()).await,
        CrashOutcome::Ignored
    );
}

#[tokio::test]
async fn exceeded_intensity_stops_the_whole_cohort() {
    let cases = [
        (
            RestartStrategy::RestForOne,
            [ChildStatus::Running, ChildStatus::Stopped, ChildStatus::Stopped],
        ),
        (
            RestartStrategy::OneForAll,
            [ChildStatus::Stopped, ChildStatus::Stopped, ChildStatus::Stopped],
        ),
    ];

    for (strategy, expected) in cases {
        let (bus, events) = recording_bus();
        let log = CreationLog::default();
        let supervisor = started(
            SupervisorBuilder::new("root")
                .strategy(strategy)
                .intensity(0, Duration::from_secs(10))
                .event_bus(bus)
                .children([log.spec("a"), log.spec("b"), log.spec("c")]),
        )
        .await;
        log.take();

        assert_eq!(
            supervisor.handle_child_crash("b", crash()).await,
            CrashOutcome::GaveUp,
            "{strategy:?}"
        );
        assert!(log.take().is_empty(), "{strategy:?}");
        let statuses: Vec<_> = supervisor
            .children_status()
            .into_iter()
            .map(|(_, status)| status)
            .collect();
        assert_eq!(statuses, expected, "{strategy:?}");

        let stopped: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::ChildStopped { child_id, reason, .. }
                    if reason == "restart intensity exceeded" =>
                {
                    Some(child_id.clone())
                }
                _ => None,
            })
            .collect();
        let expected_stopped = expected
            .iter()
            .filter(|status| **status == ChildStatus::Stopped)
            .count();
        assert_eq!(stopped.len(), expected_stopped, "{strategy:?}");
        assert!(stopped.contains(&"b".to_string()), "{strategy:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn restarts_outside_the_window_are_forgotten() {
    let log = CreationLog::default();
    let supervisor = started(
        SupervisorBuilder::new("root")
            .intensity(2, Duration::from_secs(10))
            .child(log.spec("a")),
    )
    .await;

    supervisor.handle_child_crash("a", crash()).await;
    supervisor.handle_child_crash("a", crash()).await;
    tokio::time::advance(Duration::from_secs(11)).await;

    assert!(matches!(
        supervisor.handle_child_crash("a", crash()).await,
        CrashOutcome::Restarted { .. }
    ));
    let state = supervisor.child_state("a").unwrap();
    assert_eq!(state.restart_count, 3);
    assert_eq!(state.recent_restarts, 1);
}

#[tokio::test]
async fn exceeded_intensity_escalates_once_without_fallback() {
    let reporter = Arc::new(RecordingReporter::default());
    let fallback_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&fallback_calls);
    let log = CreationLog::default();

    let supervisor = started(
        SupervisorBuilder::new("inner")
            .intensity(0, Duration::from_secs(10))
            .parent(reporter.clone())
            .child(log.spec("a").with_fallback(
                move |_: &str, _: &NodeError| -> Result<(), NodeError> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )),
    )
    .await;

    assert_eq!(
        supervisor.handle_child_crash("a", crash()).await,
        CrashOutcome::Escalated
    );
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);

    let reports = reporter.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let (reported_child, error) = &reports[0];
    assert_eq!(reported_child, "inner");
    assert!(matches!(
        error,
        NodeError::Escalated { supervisor_id, child_id, cause }
            if supervisor_id == "inner" && child_id == "a" && **cause == crash()
    ));
}

#[tokio::test]
async fn escalation_restarts_the_child_supervisor_in_the_parent() {
    let log = CreationLog::default();
    let root = started(SupervisorBuilder::new("root").child(log.spec("inner"))).await;

    let inner = started(
        SupervisorBuilder::new("inner")
            .intensity(0, Duration::from_secs(10))
            .parent(root.clone())
            .child(log.spec("worker")),
    )
    .await;
    log.take();

    assert_eq!(
        inner.handle_child_crash("worker", crash()).await,
        CrashOutcome::Escalated
    );
    assert_eq!(log.take(), vec!["inner"]);
    assert_eq!(root.child_state("inner").unwrap().restart_count, 1);
}

#[tokio::test]
async fn root_runs_degraded_fallback_when_giving_up() {
    let (bus, events) = recording_bus();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let log = CreationLog::default();

    let supervisor = started(
        SupervisorBuilder::new("root")
            .intensity(0, Duration::from_secs(10))
            .event_bus(bus)
            .child(log.spec("ok").with_fallback(
                move |child_id: &str, error: &NodeError| -> Result<(), NodeError> {
                    sink.lock().unwrap().push((child_id.to_string(), error.clone()));
                    Ok(())
                },
            ))
            .child(log.spec("broken").with_fallback(
                |_: &str, _: &NodeError| -> Result<(), NodeError> {
                    Err(NodeError::failed("no fallback available"))
                },
            )),
    )
    .await;

    assert_eq!(
        supervisor.handle_child_crash("ok", crash()).await,
        CrashOutcome::Degraded { succeeded: true }
    );
    assert_eq!(*seen.lock().unwrap(), vec![("ok".to_string(), crash())]);
    assert_eq!(
        supervisor.handle_child_crash("broken", crash()).await,
        CrashOutcome::Degraded { succeeded: false }
    );

    let degraded: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::DegradedFallback {
                child_id, succeeded, ..
            } => Some((child_id.clone(), *succeeded)),
            _ => None,
        })
        .collect();
    assert_eq!(
        degraded,
        vec![("ok".to_string(), true), ("broken".to_string(), false)]
    );
}

#[tokio::test]
async fn temporary_child_is_stopped_not_restarted() {
    let log = CreationLog::default();
    let supervisor = started(
        SupervisorBuilder::new("root")
            .child(log.spec("once").with_policy(RestartPolicy::Temporary))
            .child(log.spec("always")),
    )
    .await;
    log.take();

    assert_eq!(
        supervisor.handle_child_crash("once", crash()).await,
        CrashOutcome::Stopped
    );
    assert!(log.take().is_empty());
    assert_eq!(
        supervisor.children_status(),
        vec![
            ("once".to_string(), ChildStatus::Stopped),
            ("always".to_string(), ChildStatus::Running),
        ]
    );
    assert_eq!(
        supervisor.handle_child_crash("once", crash()).await,
        CrashOutcome::Ignored
    );
}

#[tokio::test]
async fn transient_child_restarts_on_crash() {
    let log = CreationLog::default();
    let supervisor = started(
        SupervisorBuilder::new("root")
            .child(log.spec("t").with_policy(RestartPolicy::Transient)),
    )
    .await;
    log.take();

    assert_eq!(
        supervisor.handle_child_crash("t", crash()).await,
        CrashOutcome::Restarted {
            children: vec!["t".to_string()]
        }
    );
    assert_eq!(log.take(), vec!["t"]);
}

#[tokio::test]
async fn failed_restart_leaves_child_stopped() {
    let (bus, events) = recording_bus();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let spec = ChildSpec::new("flaky", move |_: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(TestNode::shared(None))
        } else {
            Err(NodeError::failed("dependency unavailable"))
        }
    });
    let supervisor = started(SupervisorBuilder::new("root").event_bus(bus).child(spec)).await;

    assert_eq!(
        supervisor.handle_child_crash("flaky", crash()).await,
        CrashOutcome::Restarted { children: vec![] }
    );
    assert_eq!(
        supervisor.child_state("flaky").unwrap().status,
        ChildStatus::Stopped
    );
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        Event::ChildStopped { reason, .. } if reason.starts_with("restart failed")
    )));
}

#[tokio::test]
async fn unknown_child_crash_is_ignored() {
    let log = CreationLog::default();
    let supervisor = started(SupervisorBuilder::new("root").child(log.spec("a"))).await;
    assert_eq!(
        supervisor.handle_child_crash("ghost", crash()).await,
        CrashOutcome::Ignored
    );
}

#[tokio::test]
async fn start_reports_factory_failure_and_double_start() {
    let failing = ChildSpec::new("bad", |_: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
        Err(NodeError::failed("no credentials"))
    });
    let supervisor = SupervisorBuilder::new("root").child(failing).build().unwrap();
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Factory { ref child_id, .. } if child_id == "bad"));

    let log = CreationLog::default();
    let supervisor = started(SupervisorBuilder::new("root").child(log.spec("a"))).await;
    assert!(matches!(
        supervisor.start().await,
        Err(SupervisorError::AlreadyStarted { .. })
    ));
    assert_eq!(log.take(), vec!["a"]);
}

#[tokio::test]
async fn failed_start_rolls_back_and_can_be_retried() {
    let log = CreationLog::default();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = ChildSpec::new("b", move |_: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(NodeError::failed("warming up"))
        } else {
            Ok(TestNode::shared(None))
        }
    });
    let supervisor = SupervisorBuilder::new("root")
        .children([log.spec("a"), flaky, log.spec("c")])
        .build()
        .unwrap();

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Factory { ref child_id, .. } if child_id == "b"));
    assert!(!supervisor.is_running());
    assert!(supervisor.live_node("a").is_none());
    assert!(
        supervisor
            .children_status()
            .iter()
            .all(|(_, status)| *status == ChildStatus::Stopped)
    );
    assert_eq!(log.take(), vec!["a"]);

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    assert!(
        supervisor
            .children_status()
            .iter()
            .all(|(_, status)| *status == ChildStatus::Running)
    );
    assert_eq!(log.take(), vec!["a", "c"]);
}

#[tokio::test]
async fn shutdown_stops_children_and_ignores_later_crashes() {
    let (bus, events) = recording_bus();
    let log = CreationLog::default();
    let supervisor = started(
        SupervisorBuilder::new("root")
            .event_bus(bus)
            .children([log.spec("a"), log.spec("b")]),
    )
    .await;
    assert!(supervisor.is_running());

    supervisor.shutdown();
    supervisor.shutdown();

    assert!(!supervisor.is_running());
    assert!(
        supervisor
            .children_status()
            .iter()
            .all(|(_, status)| *status == ChildStatus::Stopped)
    );
    assert_eq!(
        supervisor.handle_child_crash("a", crash()).await,
        CrashOutcome::Ignored
    );
    assert!(matches!(
        supervisor.start().await,
        Err(SupervisorError::ShutDown { .. })
    ));

    let lifecycle: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .map(Event::name)
        .filter(|name| name.starts_with("supervisor:st"))
        .collect();
    assert_eq!(lifecycle, vec!["supervisor:start", "supervisor:stop"]);
}

#[tokio::test(start_paused = true)]
async fn failing_heartbeat_restarts_the_child() {
    let created = Arc::new(AtomicUsize::new(0));
    let supervisor = started(SupervisorBuilder::new("root").child(probed_child(
        "probed",
        Health::Unhealthy,
        Arc::clone(&created),
    )))
    .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(supervisor.child_state("probed").unwrap().restart_count, 1);

    // The replacement is healthy and stays up.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(created.load(Ordering::SeqCst), 2);
    supervisor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeat_counts_as_crash() {
    let created = Arc::new(AtomicUsize::new(0));
    let supervisor = started(SupervisorBuilder::new("root").child(probed_child(
        "stuck",
        Health::Hangs,
        Arc::clone(&created),
    )))
    .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(
        supervisor.child_state("stuck").unwrap().status,
        ChildStatus::Running
    );
    supervisor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn nodes_without_probe_are_never_restarted_by_heartbeat() {
    let log = CreationLog::default();
    let supervisor = started(SupervisorBuilder::new("root").child(
        log.spec("quiet")
            .with_heartbeat(Duration::from_secs(1), Duration::from_millis(200)),
    ))
    .await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(log.take(), vec!["quiet"]);
    assert_eq!(supervisor.child_state("quiet").unwrap().restart_count, 0);
    supervisor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_heartbeat_pings() {
    let pings = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pings);
    let spec = ChildSpec::new("counted", move |_: &str| -> Result<Arc<dyn AgentNode>, NodeError> {
        Ok(Arc::new(CountingNode {
            pings: Arc::clone(&counter),
        }))
    })
    .with_heartbeat(Duration::from_secs(1), Duration::from_millis(200));
    let supervisor = started(SupervisorBuilder::new("root").child(spec)).await;

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let before = pings.load(Ordering::SeqCst);
    assert_eq!(before, 3);

    supervisor.shutdown();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pings.load(Ordering::SeqCst), before);
}
