//! Memoized, single-flight runtime detection.
//!
//! Detection answers "is this CLI actually running in that pane". Results
//! are cached for a bounded TTL per `(session, kind)`. Concurrent callers
//! for the same key never run the probe twice: the second caller waits on
//! the in-flight flag and then reads the cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::backend::{SessionBackend, TerminalKey};
use crate::utils::strip_ansi;

use super::{RuntimeAdapter, RuntimeKind};

const CACHE_TTL: Duration = Duration::from_secs(30);
/// A waiter may accept a cache entry up to this old once the flight lands.
const STALE_READ_BOUND: Duration = Duration::from_secs(60);
const WAIT_STEP: Duration = Duration::from_millis(500);
const MAX_WAIT_STEPS: u32 = 30; // 15 s total
const DETECTION_CAPTURE_LINES: usize = 30;
const PROBE_SETTLE: Duration = Duration::from_millis(300);

/// Cached probe result.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub is_ready: bool,
    pub timestamp: DateTime<Utc>,
    at: tokio::time::Instant,
}

pub struct RuntimeDetector {
    backend: Arc<dyn SessionBackend>,
    cache: DashMap<(String, RuntimeKind), ProbeResult>,
    in_flight: DashMap<(String, RuntimeKind), ()>,
}

impl RuntimeDetector {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Detect whether the adapter's CLI is live in the session. Any probe
    /// error degrades to `false`.
    pub async fn detect(
        &self,
        adapter: &RuntimeAdapter,
        session_name: &str,
        force_refresh: bool,
    ) -> bool {
        let key = (session_name.to_string(), adapter.kind);

        if !force_refresh {
            if let Some(entry) = self.cache.get(&key) {
                if entry.at.elapsed() < CACHE_TTL {
                    return entry.is_ready;
                }
            }
        }

        let leader = match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        };

        if !leader {
            // Wait for the in-flight probe to settle, bounded.
            for _ in 0..MAX_WAIT_STEPS {
                tokio::time::sleep(WAIT_STEP).await;
                if !self.in_flight.contains_key(&key) {
                    break;
                }
            }
            if let Some(entry) = self.cache.get(&key) {
                if entry.at.elapsed() <= STALE_READ_BOUND {
                    return entry.is_ready;
                }
            }
            return false;
        }

        let is_ready = self.probe(adapter, session_name).await.unwrap_or(false);
        self.cache.insert(
            key.clone(),
            ProbeResult {
                is_ready,
                timestamp: Utc::now(),
                at: tokio::time::Instant::now(),
            },
        );
        self.in_flight.remove(&key);
        is_ready
    }

    /// Drop cached detections for a session, all runtime kinds.
    pub fn clear_detection_cache(&self, session_name: &str) {
        self.cache.retain(|(name, _), _| name != session_name);
    }

    async fn probe(&self, adapter: &RuntimeAdapter, session_name: &str) -> anyhow::Result<bool> {
        let capture = self
            .backend
            .capture_pane(session_name, DETECTION_CAPTURE_LINES)
            .await?;
        if Self::matches(adapter, &capture) {
            return Ok(true);
        }
        // Passive pass found nothing; adapters may opt into one active probe.
        let Some(keystroke) = &adapter.probe_keystroke else {
            return Ok(false);
        };
        debug!(
            "active detection probe for '{}' ({})",
            session_name, adapter.kind
        );
        self.backend
            .send_key(session_name, TerminalKey::Text(keystroke.clone()))
            .await?;
        tokio::time::sleep(PROBE_SETTLE).await;
        let capture = self
            .backend
            .capture_pane(session_name, DETECTION_CAPTURE_LINES)
            .await;
        // Undo whatever the probe typed before judging the capture.
        let _ = self
            .backend
            .send_key(session_name, TerminalKey::Escape)
            .await;
        Ok(Self::matches(adapter, &capture?))
    }

    fn matches(adapter: &RuntimeAdapter, raw: &str) -> bool {
        let text = strip_ansi(raw);
        adapter
            .detection_markers
            .iter()
            .any(|marker| text.contains(marker.as_str()))
    }
}
