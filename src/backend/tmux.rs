//! Default [`SessionBackend`] implementation shelling out to tmux.
//!
//! Output subscriptions are fed by a per-session polling task that diffs
//! successive pane captures and forwards the appended tail, so subscribers
//! see chunks in capture order. tmux has no native data callback over its
//! CLI surface; the diff feed is the portable equivalent.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    BackendError, BackendResult, OutputSubscription, SessionBackend, SpawnedSession, TerminalKey,
};

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(300);
const OUTPUT_CAPTURE_DEPTH: usize = 200;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

struct OutputFeed {
    senders: Vec<async_channel::Sender<String>>,
    poller: Option<JoinHandle<()>>,
}

/// tmux-backed session backend.
pub struct TmuxBackend {
    feeds: Arc<DashMap<String, OutputFeed>>,
}

impl TmuxBackend {
    /// Create a backend, verifying that tmux is installed.
    pub fn new() -> BackendResult<Self> {
        let output = std::process::Command::new("tmux")
            .arg("-V")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|_| BackendError::CommandFailed("tmux not found or not installed".into()))?;
        if !output.status.success() {
            return Err(BackendError::CommandFailed(
                "tmux not found or not installed".into(),
            ));
        }
        Ok(Self {
            feeds: Arc::new(DashMap::new()),
        })
    }

    fn validate_session_name(name: &str) -> BackendResult<()> {
        if name.is_empty() {
            return Err(BackendError::InvalidSessionName(
                "session name cannot be empty".into(),
            ));
        }
        if name.contains(':') || name.contains('.') {
            return Err(BackendError::InvalidSessionName(
                "session name cannot contain ':' or '.'".into(),
            ));
        }
        Ok(())
    }

    async fn run(args: &[&str]) -> BackendResult<std::process::Output> {
        let output = Command::new("tmux").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BackendError::CommandFailed(stderr));
        }
        Ok(output)
    }

    async fn require_session(&self, name: &str) -> BackendResult<()> {
        if !self.session_exists(name).await? {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn pane_pid(name: &str) -> Option<u32> {
        let output = Self::run(&["list-panes", "-t", name, "-F", "#{pane_pid}"])
            .await
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()?
            .trim()
            .parse()
            .ok()
    }

    fn ensure_poller(&self, name: &str) {
        let mut feed = self.feeds.entry(name.to_string()).or_insert(OutputFeed {
            senders: Vec::new(),
            poller: None,
        });
        if feed.poller.is_some() {
            return;
        }
        let session = name.to_string();
        let feeds = Arc::clone(&self.feeds);
        feed.poller = Some(tokio::spawn(async move {
            let mut last = String::new();
            let mut interval = tokio::time::interval(OUTPUT_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let capture = match Self::run(&[
                    "capture-pane",
                    "-p",
                    "-t",
                    &session,
                    "-S",
                    &format!("-{}", OUTPUT_CAPTURE_DEPTH),
                ])
                .await
                {
                    Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
                    Err(BackendError::CommandFailed(msg)) => {
                        debug!("output feed for '{}' ending: {}", session, msg);
                        break;
                    }
                    Err(e) => {
                        warn!("output capture for '{}' failed: {}", session, e);
                        continue;
                    }
                };
                let chunk = appended_tail(&last, &capture);
                last = capture;
                if chunk.is_empty() {
                    continue;
                }
                let mut dead = false;
                if let Some(mut feed) = feeds.get_mut(&session) {
                    feed.senders.retain(|tx| tx.try_send(chunk.clone()).is_ok());
                    dead = feed.senders.is_empty();
                }
                if dead {
                    break;
                }
            }
            if let Some(mut feed) = feeds.get_mut(&session) {
                feed.poller = None;
            }
        }));
    }
}

/// The portion of `current` appended since `previous`, judged by longest
/// common prefix. A full redraw (no shared prefix) yields the whole capture.
fn appended_tail(previous: &str, current: &str) -> String {
    if current == previous {
        return String::new();
    }
    let common = previous
        .bytes()
        .zip(current.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    if common == previous.len() {
        current[common..].to_string()
    } else {
        current.to_string()
    }
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    async fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> BackendResult<SpawnedSession> {
        Self::validate_session_name(name)?;
        if self.session_exists(name).await? {
            return Err(BackendError::CommandFailed(format!(
                "session '{}' already exists",
                name
            )));
        }
        let cwd = cwd.to_string_lossy().to_string();
        Self::run(&["new-session", "-d", "-s", name, "-c", &cwd]).await?;
        for (key, value) in env {
            Self::run(&["set-environment", "-t", name, key, value]).await?;
        }
        Ok(SpawnedSession {
            pid: Self::pane_pid(name).await,
        })
    }

    async fn session_exists(&self, name: &str) -> BackendResult<bool> {
        match Self::run(&["has-session", "-t", name]).await {
            Ok(_) => Ok(true),
            Err(BackendError::CommandFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_sessions(&self) -> BackendResult<Vec<String>> {
        let output = match Self::run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(out) => out,
            // No server running means no sessions.
            Err(BackendError::CommandFailed(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn write(&self, name: &str, data: &str) -> BackendResult<()> {
        self.require_session(name).await?;
        Self::run(&["send-keys", "-t", name, "-l", data]).await?;
        Ok(())
    }

    async fn send_key(&self, name: &str, key: TerminalKey) -> BackendResult<()> {
        self.require_session(name).await?;
        match key {
            TerminalKey::Enter => Self::run(&["send-keys", "-t", name, "Enter"]).await?,
            TerminalKey::CtrlC => Self::run(&["send-keys", "-t", name, "C-c"]).await?,
            TerminalKey::CtrlU => Self::run(&["send-keys", "-t", name, "C-u"]).await?,
            TerminalKey::Escape => Self::run(&["send-keys", "-t", name, "Escape"]).await?,
            TerminalKey::Text(text) => Self::run(&["send-keys", "-t", name, "-l", &text]).await?,
        };
        Ok(())
    }

    async fn capture_pane(&self, name: &str, lines: usize) -> BackendResult<String> {
        self.require_session(name).await?;
        let from = format!("-{}", lines);
        let output = Self::run(&["capture-pane", "-p", "-t", name, "-S", &from]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn subscribe_output(&self, name: &str) -> BackendResult<OutputSubscription> {
        Self::validate_session_name(name)?;
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_CHANNEL_CAPACITY);
        self.feeds
            .entry(name.to_string())
            .or_insert(OutputFeed {
                senders: Vec::new(),
                poller: None,
            })
            .senders
            .push(tx);
        self.ensure_poller(name);
        Ok(rx)
    }

    async fn kill_session(&self, name: &str) -> BackendResult<()> {
        self.require_session(name).await?;
        Self::run(&["kill-session", "-t", name]).await?;
        if let Some((_, feed)) = self.feeds.remove(name) {
            if let Some(poller) = feed.poller {
                poller.abort();
            }
        }
        Ok(())
    }

    async fn clear_command_line(&self, name: &str) -> BackendResult<()> {
        self.send_key(name, TerminalKey::CtrlU).await
    }

    async fn set_env(&self, name: &str, key: &str, value: &str) -> BackendResult<()> {
        self.require_session(name).await?;
        Self::run(&["set-environment", "-t", name, key, value]).await?;
        Ok(())
    }
}
