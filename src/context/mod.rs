//! Context-window pressure monitoring.
//!
//! One subscription per monitored session feeds a rolling parse buffer.
//! Extracted percentages drive level transitions and event publication,
//! and at critical a rate-limited session recovery. A periodic sweep
//! resets sessions whose last detection has gone stale.

pub mod parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::config::ContextSettings;
use crate::events::{Event, EventBus, EventKind};
use crate::fleet::FleetPublisher;
use crate::session::activity::ActivityTracker;
use crate::session::exit_monitor::ExitMonitor;
use crate::utils::strip_ansi;

/// Pressure levels derived from the reported context percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Normal,
    Yellow,
    Red,
    Critical,
}

impl ContextLevel {
    pub fn for_percent(percent: u8, settings: &ContextSettings) -> Self {
        if percent >= settings.critical_threshold {
            ContextLevel::Critical
        } else if percent >= settings.red_threshold {
            ContextLevel::Red
        } else if percent >= settings.yellow_threshold {
            ContextLevel::Yellow
        } else {
            ContextLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLevel::Normal => "normal",
            ContextLevel::Yellow => "yellow",
            ContextLevel::Red => "red",
            ContextLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session context state.
#[derive(Debug, Clone)]
pub struct ContextState {
    pub level: ContextLevel,
    pub context_percent: u8,
    pub last_detected_at: DateTime<Utc>,
    pub recovery_triggered: bool,
}

impl ContextState {
    fn fresh() -> Self {
        Self {
            level: ContextLevel::Normal,
            context_percent: 0,
            last_detected_at: Utc::now(),
            recovery_triggered: false,
        }
    }
}

/// Identity of the team member behind a monitored session, needed to
/// rebuild it.
#[derive(Debug, Clone)]
pub struct MonitorTarget {
    pub member_id: String,
    pub team_id: String,
    pub role: String,
}

/// Request sent to the registration collaborator when a session must be
/// rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub session_name: String,
    pub role: String,
    pub team_id: String,
    pub member_id: String,
}

#[derive(Debug, Clone)]
pub struct RegistrationResponse {
    pub success: bool,
    pub session_name: String,
}

/// Collaborator that can rebuild an exhausted agent session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRegistration: Send + Sync {
    async fn create_agent_session(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse>;
}

struct MonitoredSession {
    target: MonitorTarget,
    buffer: String,
    buffer_cap_reported: bool,
    state: ContextState,
    task: Option<JoinHandle<()>>,
}

/// What a processed chunk asks the caller to do next.
pub enum ChunkOutcome {
    Continue,
    Recover(MonitorTarget),
}

/// Process-wide context monitor with an explicit lifecycle.
pub struct ContextWindowMonitor {
    backend: Arc<dyn SessionBackend>,
    events: EventBus,
    activity: Arc<ActivityTracker>,
    exit_monitor: Arc<ExitMonitor>,
    registration: Arc<dyn AgentRegistration>,
    fleet: std::sync::Mutex<Option<Arc<FleetPublisher>>>,
    settings: ContextSettings,
    sessions: DashMap<String, Arc<Mutex<MonitoredSession>>>,
    /// Recovery timestamps survive monitor restarts so the cooldown holds
    /// across the rebuild cycle.
    recovery_history: DashMap<String, Vec<i64>>,
    running: AtomicBool,
    sweep: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ContextWindowMonitor {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        events: EventBus,
        activity: Arc<ActivityTracker>,
        exit_monitor: Arc<ExitMonitor>,
        registration: Arc<dyn AgentRegistration>,
        settings: ContextSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            events,
            activity,
            exit_monitor,
            registration,
            fleet: std::sync::Mutex::new(None),
            settings,
            sessions: DashMap::new(),
            recovery_history: DashMap::new(),
            running: AtomicBool::new(false),
            sweep: std::sync::Mutex::new(None),
        })
    }

    /// Wire the fleet publisher so level transitions trigger an immediate
    /// status broadcast.
    pub fn attach_fleet(&self, fleet: Arc<FleetPublisher>) {
        *self.fleet.lock().expect("fleet handle lock") = Some(fleet);
    }

    /// Start the stale-detection sweep.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(monitor.settings.check_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !monitor.running.load(Ordering::SeqCst) {
                    break;
                }
                monitor.sweep_stale().await;
            }
        });
        if let Some(previous) = self.sweep.lock().expect("sweep lock").replace(handle) {
            previous.abort();
        }
        info!("context window monitor started");
    }

    /// Stop the sweep. Per-session subscriptions stay in place until
    /// explicitly stopped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweep.lock().expect("sweep lock").take() {
            handle.abort();
        }
        info!("context window monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin monitoring a session. Replaces any prior monitoring for the
    /// same name. The session must exist in the backend.
    pub async fn start_session_monitoring(
        self: &Arc<Self>,
        session_name: &str,
        member_id: &str,
        team_id: &str,
        role: &str,
    ) -> Result<()> {
        if !self.backend.session_exists(session_name).await? {
            anyhow::bail!("cannot monitor '{}': session does not exist", session_name);
        }
        self.stop_session_monitoring(session_name);

        let rx = self.backend.subscribe_output(session_name)?;
        let entry = Arc::new(Mutex::new(MonitoredSession {
            target: MonitorTarget {
                member_id: member_id.to_string(),
                team_id: team_id.to_string(),
                role: role.to_string(),
            },
            buffer: String::new(),
            buffer_cap_reported: false,
            state: ContextState::fresh(),
            task: None,
        }));
        self.sessions
            .insert(session_name.to_string(), Arc::clone(&entry));

        let monitor = Arc::clone(self);
        let name = session_name.to_string();
        let consumer_entry = Arc::clone(&entry);
        let task = tokio::spawn(async move {
            while let Ok(chunk) = rx.recv().await {
                match monitor.handle_chunk(&name, &consumer_entry, &chunk).await {
                    ChunkOutcome::Continue => {}
                    ChunkOutcome::Recover(target) => {
                        monitor.run_recovery(&name, target).await;
                        break;
                    }
                }
            }
            debug!("context consumer ended");
        });
        entry.lock().await.task = Some(task);
        info!("context monitoring started for '{}'", session_name);
        Ok(())
    }

    /// Stop monitoring a session and drop its state.
    pub fn stop_session_monitoring(&self, session_name: &str) {
        if let Some((_, entry)) = self.sessions.remove(session_name) {
            if let Ok(mut guard) = entry.try_lock() {
                if let Some(task) = guard.task.take() {
                    task.abort();
                }
            } else {
                // Consumer is mid-chunk; it will notice the missing entry
                // and end on its own after the current chunk.
            }
            debug!("context monitoring stopped for '{}'", session_name);
        }
    }

    pub fn is_monitoring(&self, session_name: &str) -> bool {
        self.sessions.contains_key(session_name)
    }

    pub async fn context_state(&self, session_name: &str) -> Option<ContextState> {
        let entry = self.sessions.get(session_name).map(|e| Arc::clone(e.value()))?;
        let guard = entry.lock().await;
        Some(guard.state.clone())
    }

    /// Recovery timestamps currently inside the cooldown window.
    pub fn recovery_timestamps(&self, session_name: &str) -> Vec<i64> {
        self.recovery_history
            .get(session_name)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn seed_recovery_timestamps(&self, session_name: &str, timestamps: Vec<i64>) {
        self.recovery_history
            .insert(session_name.to_string(), timestamps);
    }

    #[cfg(test)]
    pub async fn backdate_detection(&self, session_name: &str, ms: i64) {
        if let Some(entry) = self.sessions.get(session_name).map(|e| Arc::clone(e.value())) {
            let mut guard = entry.lock().await;
            guard.state.last_detected_at =
                guard.state.last_detected_at - chrono::Duration::milliseconds(ms);
        }
    }

    #[cfg(test)]
    pub async fn run_stale_sweep(&self) {
        self.sweep_stale().await;
    }

    async fn handle_chunk(
        self: &Arc<Self>,
        name: &str,
        entry: &Arc<Mutex<MonitoredSession>>,
        chunk: &str,
    ) -> ChunkOutcome {
        if !self.sessions.contains_key(name) {
            return ChunkOutcome::Continue;
        }
        self.activity.record_filtered_activity(name, chunk);

        let extracted = {
            let mut guard = entry.lock().await;
            guard.buffer.push_str(&strip_ansi(chunk));
            if guard.buffer.len() > self.settings.max_buffer_size {
                let excess = guard.buffer.len() - self.settings.max_buffer_size;
                // Keep the split on a char boundary.
                let mut cut = excess;
                while cut < guard.buffer.len() && !guard.buffer.is_char_boundary(cut) {
                    cut += 1;
                }
                guard.buffer.drain(..cut);
                if !guard.buffer_cap_reported {
                    guard.buffer_cap_reported = true;
                    self.events
                        .publish(Event::new(EventKind::BufferCapped).with_session(name));
                }
            }
            let extracted = parser::extract_context_percent(&guard.buffer);
            if extracted.is_some() {
                guard.buffer.clear();
            }
            extracted
        };

        match extracted {
            Some(percent) => self.update_context_usage(name, percent).await,
            None => ChunkOutcome::Continue,
        }
    }

    /// Apply an observed percentage: at most one level transition, one
    /// published event, and one fleet broadcast per call.
    pub async fn update_context_usage(
        self: &Arc<Self>,
        name: &str,
        percent: u8,
    ) -> ChunkOutcome {
        let Some(entry) = self.sessions.get(name).map(|e| Arc::clone(e.value())) else {
            return ChunkOutcome::Continue;
        };
        let mut guard = entry.lock().await;
        let previous = guard.state.level;
        let next = ContextLevel::for_percent(percent, &self.settings);
        guard.state.context_percent = percent;
        guard.state.last_detected_at = Utc::now();

        if next == previous {
            return ChunkOutcome::Continue;
        }

        // Payload reflects the state at transition time, before any
        // recovery bookkeeping mutates it.
        let kind = if next == ContextLevel::Critical {
            EventKind::ContextCritical
        } else {
            EventKind::ContextWarning
        };
        let event = Event::new(kind)
            .with_session(name)
            .with_team(guard.target.team_id.clone(), guard.target.member_id.clone())
            .with_change("contextLevel", previous.as_str(), next.as_str())
            .with_metadata(serde_json::json!({ "contextPercent": percent }));
        self.events.publish(event);
        self.broadcast_fleet_update();
        guard.state.level = next;

        if next != ContextLevel::Critical || guard.state.recovery_triggered {
            return ChunkOutcome::Continue;
        }

        if self.recovery_in_cooldown(name) {
            warn!(
                "recovery suppressed for '{}': {} recoveries within window",
                name, self.settings.max_recoveries_per_window
            );
            self.events.publish(
                Event::new(EventKind::RecoverySuppressed)
                    .with_session(name)
                    .with_metadata(serde_json::json!({ "contextPercent": percent })),
            );
            return ChunkOutcome::Continue;
        }

        guard.state.recovery_triggered = true;
        ChunkOutcome::Recover(guard.target.clone())
    }

    fn recovery_in_cooldown(&self, name: &str) -> bool {
        let now = Utc::now().timestamp_millis();
        let window = self.settings.cooldown_window_ms as i64;
        let recent = self
            .recovery_history
            .get(name)
            .map(|v| v.iter().filter(|t| now - **t < window).count())
            .unwrap_or(0);
        recent >= self.settings.max_recoveries_per_window
    }

    async fn run_recovery(self: &Arc<Self>, name: &str, target: MonitorTarget) {
        info!("context recovery starting for '{}'", name);
        self.exit_monitor.stop_watch(name);
        self.activity.clear(name);

        let request = RegistrationRequest {
            session_name: name.to_string(),
            role: target.role.clone(),
            team_id: target.team_id.clone(),
            member_id: target.member_id.clone(),
        };
        match self.registration.create_agent_session(request).await {
            Ok(response) if response.success => {
                info!("session '{}' rebuilt", response.session_name);
            }
            Ok(_) => warn!("registration collaborator declined to rebuild '{}'", name),
            Err(e) => warn!("failed to rebuild session '{}': {:#}", name, e),
        }

        let now = Utc::now().timestamp_millis();
        let window = self.settings.cooldown_window_ms as i64;
        let mut history = self.recovery_history.entry(name.to_string()).or_default();
        history.push(now);
        history.retain(|t| now - *t < window);
        drop(history);

        // The rebuilt session restarts monitoring from scratch.
        self.stop_session_monitoring(name);
    }

    async fn sweep_stale(&self) {
        let threshold = self.settings.stale_detection_threshold_ms as i64;
        let now = Utc::now().timestamp_millis();
        let entries: Vec<(String, Arc<Mutex<MonitoredSession>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (name, entry) in entries {
            let mut guard = entry.lock().await;
            if guard.state.level == ContextLevel::Normal {
                continue;
            }
            let age = now - guard.state.last_detected_at.timestamp_millis();
            if age > threshold {
                debug!(
                    "stale context detection for '{}' ({}ms old), resetting to normal",
                    name, age
                );
                guard.state.level = ContextLevel::Normal;
                guard.state.recovery_triggered = false;
            }
        }
    }

    fn broadcast_fleet_update(&self) {
        if let Some(fleet) = self.fleet.lock().expect("fleet handle lock").as_ref() {
            fleet.request_poll();
        }
    }
}
