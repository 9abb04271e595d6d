//! Exit-pattern watching.
//!
//! Each watched session gets a task scanning its output stream against the
//! runtime adapter's exit vocabulary. The first match downgrades the session
//! to `inactive`, emits `session_exited`, and ends the watch. Later matches
//! (or a second stop) are ignored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::events::{Event, EventBus, EventKind};
use crate::session::{SessionRegistry, SessionStatus};
use crate::utils::strip_ansi;

/// Tracks which sessions currently have an exit watch registered.
#[derive(Default)]
pub struct RegistrationTracker {
    registered: DashMap<String, DateTime<Utc>>,
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watch; returns false if one was already registered.
    pub fn register(&self, name: &str) -> bool {
        self.registered
            .insert(name.to_string(), Utc::now())
            .is_none()
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.registered.remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.contains_key(name)
    }

    pub fn registered_since(&self, name: &str) -> Option<DateTime<Utc>> {
        self.registered.get(name).map(|v| *v)
    }
}

pub struct ExitMonitor {
    backend: Arc<dyn SessionBackend>,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    tracker: RegistrationTracker,
    watches: DashMap<String, JoinHandle<()>>,
}

impl ExitMonitor {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        registry: Arc<SessionRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            backend,
            registry,
            events,
            tracker: RegistrationTracker::new(),
            watches: DashMap::new(),
        }
    }

    pub fn tracker(&self) -> &RegistrationTracker {
        &self.tracker
    }

    /// Start watching a session's output for exit patterns. An existing
    /// watch for the same session is replaced.
    pub fn start_watch(
        self: &Arc<Self>,
        session_name: &str,
        agent_id: &str,
        exit_patterns: Vec<Regex>,
    ) -> anyhow::Result<()> {
        self.stop_watch(session_name);
        let rx = self.backend.subscribe_output(session_name)?;
        self.tracker.register(session_name);

        let monitor = Arc::clone(self);
        let name = session_name.to_string();
        let agent = agent_id.to_string();
        let handle = tokio::spawn(async move {
            while let Ok(chunk) = rx.recv().await {
                let text = strip_ansi(&chunk);
                let Some(matched) = exit_patterns.iter().find(|p| p.is_match(&text)) else {
                    continue;
                };
                // Watch may have been stopped between receipt and match.
                if !monitor.tracker.deregister(&name) {
                    break;
                }
                info!("exit pattern matched for session '{}'", name);
                if let Err(e) = monitor.registry.set_status(&name, SessionStatus::Inactive).await {
                    warn!("could not downgrade session '{}': {:#}", name, e);
                }
                monitor.events.publish(
                    Event::new(EventKind::SessionExited)
                        .with_session(&name)
                        .with_agent(&agent)
                        .with_change("status", "active", "inactive")
                        .with_metadata(serde_json::json!({ "pattern": matched.as_str() })),
                );
                break;
            }
            debug!("exit watch ended");
        });

        if let Some(previous) = self.watches.insert(session_name.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop watching a session. Safe to call for sessions never watched.
    pub fn stop_watch(&self, session_name: &str) {
        self.tracker.deregister(session_name);
        if let Some((_, handle)) = self.watches.remove(session_name) {
            handle.abort();
        }
    }

    pub fn stop_all(&self) {
        let names: Vec<String> = self.watches.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_watch(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_tracker_is_idempotent() {
        let tracker = RegistrationTracker::new();
        assert!(tracker.register("dev-1"));
        assert!(!tracker.register("dev-1"));
        assert!(tracker.is_registered("dev-1"));
        assert!(tracker.deregister("dev-1"));
        assert!(!tracker.deregister("dev-1"));
    }
}
