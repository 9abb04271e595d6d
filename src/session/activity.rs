//! Per-session activity tracking.
//!
//! Records when a session last produced meaningful terminal output. Spinner
//! frames and cursor repositioning do not count: filtered recording only
//! fires once the ANSI-stripped, whitespace-collapsed payload reaches a
//! minimum size.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::utils::{collapse_whitespace, strip_ansi};

/// Minimum stripped payload size for output to count as activity.
pub const MIN_MEANINGFUL_OUTPUT_BYTES: usize = 10;

#[derive(Default)]
pub struct ActivityTracker {
    last_activity_ms: DashMap<String, i64>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity unconditionally.
    pub fn record_activity(&self, name: &str) {
        self.last_activity_ms
            .insert(name.to_string(), Utc::now().timestamp_millis());
    }

    /// Record activity only if the raw chunk carries meaningful content.
    pub fn record_filtered_activity(&self, name: &str, raw: &str) {
        let meaningful = collapse_whitespace(&strip_ansi(raw));
        if meaningful.len() >= MIN_MEANINGFUL_OUTPUT_BYTES {
            self.record_activity(name);
        }
    }

    /// Milliseconds since last recorded activity; 0 for a never-seen session.
    pub fn idle_time_ms(&self, name: &str) -> i64 {
        match self.last_activity_ms.get(name) {
            Some(last) => (Utc::now().timestamp_millis() - *last).max(0),
            None => 0,
        }
    }

    /// Whether the session has been idle for at least `duration`. A session
    /// that was never seen is not idle.
    pub fn is_idle_for(&self, name: &str, duration: Duration) -> bool {
        match self.last_activity_ms.get(name) {
            Some(last) => {
                Utc::now().timestamp_millis() - *last >= duration.as_millis() as i64
            }
            None => false,
        }
    }

    pub fn clear(&self, name: &str) {
        self.last_activity_ms.remove(name);
    }

    pub fn last_seen_ms(&self, name: &str) -> Option<i64> {
        self.last_activity_ms.get(name).map(|v| *v)
    }

    #[cfg(test)]
    pub fn seed(&self, name: &str, epoch_ms: i64) {
        self.last_activity_ms.insert(name.to_string(), epoch_ms);
    }
}
