//! Fleet state publisher: one internal poll loop multiplexed to any number
//! of SSE subscribers.
//!
//! The loop runs only while at least one subscriber is connected. Each tick
//! pulls a snapshot, hashes the significant subset (agent count, active
//! count, per-agent id/status/rounded CPU), and broadcasts a `state` event
//! only when the hash moves. Subscribers that cannot accept a write are
//! dropped.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// One agent row in a fleet snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAgent {
    pub id: String,
    pub session_name: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub status: String,
    pub cpu_percent: f32,
    pub session_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub active_count: usize,
    pub idle_count: usize,
    pub dormant_count: usize,
    pub total_tokens: u64,
}

/// Immutable snapshot of the whole fleet, produced by the poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub timestamp: DateTime<Utc>,
    pub agents: Vec<FleetAgent>,
    pub projects: Vec<String>,
    pub stats: FleetStats,
}

/// Produces fleet snapshots; implemented by the kernel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fleet_snapshot(&self) -> anyhow::Result<FleetSnapshot>;
}

/// One wire-format SSE frame: `event: <name>\ndata: <json>\n\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

impl SseFrame {
    fn new(event: &'static str, data: &impl Serialize) -> Self {
        Self {
            event,
            data: serde_json::to_string(data).expect("serializable SSE payload"),
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Significance hash: agent count, active count, and each agent's
/// `(id, status, rounded cpu)` sorted lexicographically.
pub fn significance_hash(snapshot: &FleetSnapshot) -> u64 {
    let mut rows: Vec<String> = snapshot
        .agents
        .iter()
        .map(|a| format!("{}|{}|{}", a.id, a.status, a.cpu_percent.round() as i64))
        .collect();
    rows.sort();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    snapshot.agents.len().hash(&mut hasher);
    snapshot.stats.active_count.hash(&mut hasher);
    for row in rows {
        row.hash(&mut hasher);
    }
    hasher.finish()
}

struct PublisherState {
    subscribers: HashMap<String, async_channel::Sender<SseFrame>>,
    last_hash: Option<u64>,
    last_snapshot: Option<Arc<FleetSnapshot>>,
    last_state_frame: Option<SseFrame>,
    loops: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

pub struct FleetPublisher {
    source: Arc<dyn SnapshotSource>,
    state: Mutex<PublisherState>,
    poke: Notify,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

impl FleetPublisher {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        poll_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            state: Mutex::new(PublisherState {
                subscribers: HashMap::new(),
                last_hash: None,
                last_snapshot: None,
                last_state_frame: None,
                loops: None,
            }),
            poke: Notify::new(),
            poll_interval,
            heartbeat_interval,
        })
    }

    /// Register a subscriber. It immediately receives `connected`, plus the
    /// last known `state` if one exists. The 0→1 transition starts the poll
    /// loop with an immediate first poll.
    pub async fn subscribe(
        self: &Arc<Self>,
        id: &str,
    ) -> async_channel::Receiver<SseFrame> {
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        let start_loops = {
            let mut state = self.state.lock().await;
            let connected = SseFrame::new(
                "connected",
                &serde_json::json!({ "subscriberId": id, "timestamp": Utc::now() }),
            );
            let _ = tx.try_send(connected);
            if let Some(frame) = &state.last_state_frame {
                let _ = tx.try_send(frame.clone());
            }
            state.subscribers.insert(id.to_string(), tx);
            let first = state.subscribers.len() == 1 && state.loops.is_none();
            if first {
                state.loops = Some(self.spawn_loops());
            }
            first
        };
        if start_loops {
            self.poke.notify_one();
        }
        info!("fleet subscriber '{}' connected", id);
        rx
    }

    /// Remove a subscriber. The 1→0 transition stops the loop and clears
    /// the cached snapshot.
    pub async fn unsubscribe(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.subscribers.remove(id).is_none() {
            return;
        }
        info!("fleet subscriber '{}' disconnected", id);
        if state.subscribers.is_empty() {
            if let Some((poll, heartbeat)) = state.loops.take() {
                poll.abort();
                heartbeat.abort();
            }
            state.last_snapshot = None;
            state.last_hash = None;
            state.last_state_frame = None;
            debug!("fleet publisher idle, loop stopped");
        }
    }

    /// Ask the loop for an immediate out-of-cadence poll.
    pub fn request_poll(&self) {
        self.poke.notify_one();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn last_snapshot(&self) -> Option<Arc<FleetSnapshot>> {
        self.state.lock().await.last_snapshot.clone()
    }

    /// End every subscriber stream and stop the loops.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some((poll, heartbeat)) = state.loops.take() {
            poll.abort();
            heartbeat.abort();
        }
        for (_, tx) in state.subscribers.drain() {
            tx.close();
        }
        state.last_snapshot = None;
        state.last_hash = None;
        state.last_state_frame = None;
    }

    fn spawn_loops(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let publisher = Arc::clone(self);
        let poll = tokio::spawn(async move {
            loop {
                publisher.poll_once().await;
                tokio::select! {
                    _ = tokio::time::sleep(publisher.poll_interval) => {}
                    _ = publisher.poke.notified() => {}
                }
            }
        });
        let publisher = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(publisher.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // immediate first tick is not a heartbeat
            loop {
                interval.tick().await;
                let frame =
                    SseFrame::new("heartbeat", &serde_json::json!({ "timestamp": Utc::now() }));
                publisher.broadcast(frame).await;
            }
        });
        (poll, heartbeat)
    }

    /// One poll tick: fetch, hash, and broadcast on change. Poll failures
    /// become `error` events and keep the last good snapshot.
    pub async fn poll_once(self: &Arc<Self>) {
        match self.source.fleet_snapshot().await {
            Ok(snapshot) => {
                let hash = significance_hash(&snapshot);
                let frame = {
                    let mut state = self.state.lock().await;
                    if state.last_hash == Some(hash) {
                        return;
                    }
                    let frame = SseFrame::new("state", &snapshot);
                    state.last_hash = Some(hash);
                    state.last_snapshot = Some(Arc::new(snapshot));
                    state.last_state_frame = Some(frame.clone());
                    frame
                };
                self.broadcast(frame).await;
            }
            Err(e) => {
                warn!("fleet poll failed: {:#}", e);
                let frame = SseFrame::new(
                    "error",
                    &serde_json::json!({ "code": "POLL_ERROR", "message": e.to_string() }),
                );
                self.broadcast(frame).await;
            }
        }
    }

    /// Deliver a frame to every subscriber; a failed write drops the
    /// subscriber.
    async fn broadcast(&self, frame: SseFrame) {
        let mut dropped = Vec::new();
        {
            let state = self.state.lock().await;
            for (id, tx) in &state.subscribers {
                if tx.try_send(frame.clone()).is_err() {
                    dropped.push(id.clone());
                }
            }
        }
        for id in dropped {
            warn!("dropping unresponsive fleet subscriber '{}'", id);
            self.unsubscribe(&id).await;
        }
    }
}
