//! Context pressure scenarios: warning escalation, recovery, cooldown
//! suppression, staleness, and idempotence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::backend::SessionBackend;
use crate::config::ContextSettings;
use crate::context::{AgentRegistration, ContextLevel, ContextWindowMonitor};
use crate::events::{Event, EventBus, EventKind};
use crate::runtime::claude_code;
use crate::session::activity::ActivityTracker;
use crate::session::exit_monitor::ExitMonitor;
use crate::session::{Session, SessionRegistry};
use crate::runtime::RuntimeKind;

use super::fixtures::{RecordingRegistration, ScriptedBackend};

struct Harness {
    backend: Arc<ScriptedBackend>,
    monitor: Arc<ContextWindowMonitor>,
    exit_monitor: Arc<ExitMonitor>,
    activity: Arc<ActivityTracker>,
    registration: Arc<RecordingRegistration>,
    events_rx: tokio::sync::broadcast::Receiver<Event>,
}

async fn harness() -> Harness {
    let backend = ScriptedBackend::new();
    backend.add_session("dev-1");
    let events = EventBus::new();
    let events_rx = events.subscribe();
    let registry = Arc::new(SessionRegistry::new(None));
    registry
        .insert(Session::new(
            "dev-1",
            "agent-1",
            "developer",
            "team-1",
            PathBuf::from("/tmp/demo"),
            RuntimeKind::ClaudeCode,
        ))
        .await
        .unwrap();
    let activity = Arc::new(ActivityTracker::new());
    let exit_monitor = Arc::new(ExitMonitor::new(
        backend.clone() as Arc<dyn SessionBackend>,
        registry,
        events.clone(),
    ));
    let registration = RecordingRegistration::new();
    let monitor = ContextWindowMonitor::new(
        backend.clone() as Arc<dyn SessionBackend>,
        events,
        Arc::clone(&activity),
        Arc::clone(&exit_monitor),
        registration.clone() as Arc<dyn AgentRegistration>,
        ContextSettings::default(),
    );
    Harness {
        backend,
        monitor,
        exit_monitor,
        activity,
        registration,
        events_rx,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_warning_escalation_then_recovery() {
    let mut h = harness().await;
    h.exit_monitor
        .start_watch("dev-1", "agent-1", claude_code::adapter().exit_patterns())
        .unwrap();
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();

    h.backend.push_output("dev-1", "45% context").await;
    settle().await;
    assert!(drain(&mut h.events_rx).is_empty());

    h.backend.push_output("dev-1", "72% context").await;
    settle().await;
    let events = drain(&mut h.events_rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ContextWarning);
    assert_eq!(events[0].previous_value.as_deref(), Some("normal"));
    assert_eq!(events[0].new_value.as_deref(), Some("yellow"));

    h.backend.push_output("dev-1", "96% context").await;
    settle().await;
    let events = drain(&mut h.events_rx);
    assert_eq!(events.len(), 1, "exactly one critical event: {:?}", events);
    assert_eq!(events[0].kind, EventKind::ContextCritical);
    assert_eq!(events[0].new_value.as_deref(), Some("critical"));

    // Recovery ran once against the registration collaborator.
    assert_eq!(h.registration.call_count(), 1);
    let request = h.registration.calls.lock().unwrap()[0].clone();
    assert_eq!(request.session_name, "dev-1");
    assert_eq!(request.role, "developer");
    assert_eq!(request.member_id, "member-1");

    // Monitoring, activity, and the exit watch were torn down.
    assert!(!h.monitor.is_monitoring("dev-1"));
    assert!(h.activity.last_seen_ms("dev-1").is_none());
    assert!(!h.exit_monitor.tracker().is_registered("dev-1"));
    assert_eq!(h.monitor.recovery_timestamps("dev-1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_suppressed_inside_cooldown_window() {
    let mut h = harness().await;
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();

    let now = Utc::now().timestamp_millis();
    h.monitor
        .seed_recovery_timestamps("dev-1", vec![now - 1_000, now - 2_000, now - 3_000]);

    h.backend.push_output("dev-1", "98% context").await;
    settle().await;

    let events = drain(&mut h.events_rx);
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::ContextCritical));
    assert!(kinds.contains(&EventKind::RecoverySuppressed));
    assert_eq!(h.registration.call_count(), 0);

    // The level still transitioned; monitoring stays up.
    assert!(h.monitor.is_monitoring("dev-1"));
    let state = h.monitor.context_state("dev-1").await.unwrap();
    assert_eq!(state.level, ContextLevel::Critical);
    assert!(!state.recovery_triggered);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_percent_fires_no_additional_event() {
    let mut h = harness().await;
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();

    h.backend.push_output("dev-1", "72% context").await;
    settle().await;
    h.backend.push_output("dev-1", "72% context").await;
    settle().await;

    let events = drain(&mut h.events_rx);
    assert_eq!(events.len(), 1);
    let state = h.monitor.context_state("dev-1").await.unwrap();
    assert_eq!(state.level, ContextLevel::Yellow);
    assert_eq!(state.context_percent, 72);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_session_ignores_chunks() {
    let mut h = harness().await;
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();
    h.monitor.stop_session_monitoring("dev-1");

    h.backend.push_output("dev-1", "99% context").await;
    settle().await;

    assert!(drain(&mut h.events_rx).is_empty());
    assert_eq!(h.registration.call_count(), 0);
    assert!(h.monitor.context_state("dev-1").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stale_detection_resets_to_normal_without_event() {
    let mut h = harness().await;
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();

    h.backend.push_output("dev-1", "72% context").await;
    settle().await;
    assert_eq!(drain(&mut h.events_rx).len(), 1);

    // Older than STALE_DETECTION_THRESHOLD_MS.
    h.monitor.backdate_detection("dev-1", 400_000).await;
    h.monitor.run_stale_sweep().await;

    let state = h.monitor.context_state("dev-1").await.unwrap();
    assert_eq!(state.level, ContextLevel::Normal);
    assert!(!state.recovery_triggered);
    assert!(drain(&mut h.events_rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_full_context_triggers_recovery_exactly_once() {
    let mut h = harness().await;
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();

    h.backend.push_output("dev-1", "100% context").await;
    settle().await;
    h.backend.push_output("dev-1", "100% context").await;
    settle().await;

    let events = drain(&mut h.events_rx);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::ContextCritical)
            .count(),
        1
    );
    assert_eq!(h.registration.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_marker_split_across_chunks_is_detected() {
    let mut h = harness().await;
    h.monitor
        .start_session_monitoring("dev-1", "member-1", "team-1", "developer")
        .await
        .unwrap();

    // The rolling buffer joins partial chunks.
    h.backend.push_output("dev-1", "72% co").await;
    h.backend.push_output("dev-1", "ntext remaining").await;
    settle().await;

    let events = drain(&mut h.events_rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ContextWarning);
}

#[tokio::test(start_paused = true)]
async fn test_monitoring_requires_backend_session() {
    let h = harness().await;
    let result = h
        .monitor
        .start_session_monitoring("ghost", "member-1", "team-1", "developer")
        .await;
    assert!(result.is_err());
}
