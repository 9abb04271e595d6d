//! Agent session records and the registry that owns them.
//!
//! The kernel exclusively owns the registry; monitors look sessions up by
//! name. A session's status only progresses forward except on explicit
//! recovery, which resets it to `Starting`.

pub mod activity;
pub mod exit_monitor;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::runtime::RuntimeKind;
use crate::utils::ErrorContext;

/// Life-cycle status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Inactive,
    Starting,
    Started,
    Active,
}

impl SessionStatus {
    fn rank(&self) -> u8 {
        match self {
            SessionStatus::Inactive => 0,
            SessionStatus::Starting => 1,
            SessionStatus::Started => 2,
            SessionStatus::Active => 3,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Inactive => "inactive",
            SessionStatus::Starting => "starting",
            SessionStatus::Started => "started",
            SessionStatus::Active => "active",
        };
        f.write_str(s)
    }
}

/// Whether the agent currently has work in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingStatus {
    Idle,
    InProgress,
}

/// One managed agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_name: String,
    pub agent_id: String,
    pub role: String,
    pub team_id: String,
    pub project_path: PathBuf,
    pub runtime_kind: RuntimeKind,
    pub status: SessionStatus,
    pub working_status: WorkingStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_name: impl Into<String>,
        agent_id: impl Into<String>,
        role: impl Into<String>,
        team_id: impl Into<String>,
        project_path: PathBuf,
        runtime_kind: RuntimeKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_name: session_name.into(),
            agent_id: agent_id.into(),
            role: role.into(),
            team_id: team_id.into(),
            project_path,
            runtime_kind,
            status: SessionStatus::Inactive,
            working_status: WorkingStatus::Idle,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Registry of sessions keyed by session name. Mutations take the exclusive
/// lock; reads clone out.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    persist_path: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persist_path,
        }
    }

    /// Insert a new session. At most one session may exist per name.
    pub async fn insert(&self, session: Session) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session.session_name) {
                anyhow::bail!("session '{}' already registered", session.session_name);
            }
            sessions.insert(session.session_name.clone(), session);
        }
        self.persist().await;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Session> {
        self.sessions.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    /// Advance a session's status. Backward transitions are rejected with a
    /// logged assertion, except the downgrade to `Inactive` (terminal exit)
    /// which is always allowed.
    pub async fn set_status(&self, name: &str, status: SessionStatus) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("session '{}' not registered", name))?;
            if status != SessionStatus::Inactive && status.rank() < session.status.rank() {
                warn!(
                    "refusing backward status transition for '{}': {} -> {}",
                    name, session.status, status
                );
                return Ok(());
            }
            session.status = status;
            session.touch();
        }
        self.persist().await;
        Ok(())
    }

    /// Explicit recovery reset: back to `Starting` regardless of rank.
    pub async fn reset_for_recovery(&self, name: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("session '{}' not registered", name))?;
            session.status = SessionStatus::Starting;
            session.working_status = WorkingStatus::Idle;
            session.touch();
        }
        self.persist().await;
        Ok(())
    }

    pub async fn set_working_status(&self, name: &str, working: WorkingStatus) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("session '{}' not registered", name))?;
        session.working_status = working;
        session.touch();
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Option<Session> {
        let removed = self.sessions.write().await.remove(name);
        if removed.is_some() {
            self.persist().await;
        }
        removed
    }

    /// Write the registry snapshot atomically, if persistence is configured.
    pub async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let snapshot: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        if let Err(e) = write_atomic(path, &snapshot) {
            warn!("failed to persist session registry: {:#}", e);
        }
    }

    /// Restore persisted sessions, returning the restored names. Missing or
    /// malformed files restore nothing.
    pub async fn restore(&self) -> Vec<String> {
        let Some(path) = &self.persist_path else {
            return Vec::new();
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        let parsed: Vec<Session> = match serde_json::from_str(&raw) {
            Ok(list) => list,
            Err(e) => {
                warn!("ignoring malformed session snapshot {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        let mut sessions = self.sessions.write().await;
        let mut names = Vec::new();
        for session in parsed {
            names.push(session.session_name.clone());
            sessions.insert(session.session_name.clone(), session);
        }
        names
    }
}

fn write_atomic(path: &std::path::Path, snapshot: &[Session]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    std::fs::create_dir_all(dir).during_path("creating the snapshot directory", dir)?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).during("creating the snapshot temp file")?;
    serde_json::to_writer_pretty(&mut tmp, snapshot).during("encoding the session snapshot")?;
    tmp.flush().during("flushing the session snapshot")?;
    tmp.persist(path)
        .during_path("replacing the session snapshot", path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str) -> Session {
        Session::new(
            name,
            "agent-1",
            "developer",
            "team-1",
            PathBuf::from("/tmp/project"),
            RuntimeKind::ClaudeCode,
        )
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let registry = SessionRegistry::new(None);
        registry.insert(session("dev-1")).await.unwrap();
        assert!(registry.insert(session("dev-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_status_progresses_monotonically() {
        let registry = SessionRegistry::new(None);
        registry.insert(session("dev-1")).await.unwrap();
        registry
            .set_status("dev-1", SessionStatus::Active)
            .await
            .unwrap();
        // Backward transition is dropped.
        registry
            .set_status("dev-1", SessionStatus::Starting)
            .await
            .unwrap();
        assert_eq!(
            registry.get("dev-1").await.unwrap().status,
            SessionStatus::Active
        );
        // Exit downgrade is always allowed.
        registry
            .set_status("dev-1", SessionStatus::Inactive)
            .await
            .unwrap();
        assert_eq!(
            registry.get("dev-1").await.unwrap().status,
            SessionStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_recovery_reset_goes_back_to_starting() {
        let registry = SessionRegistry::new(None);
        registry.insert(session("dev-1")).await.unwrap();
        registry
            .set_status("dev-1", SessionStatus::Active)
            .await
            .unwrap();
        registry.reset_for_recovery("dev-1").await.unwrap();
        let s = registry.get("dev-1").await.unwrap();
        assert_eq!(s.status, SessionStatus::Starting);
        assert_eq!(s.working_status, WorkingStatus::Idle);
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let registry = SessionRegistry::new(Some(path.clone()));
            registry.insert(session("dev-1")).await.unwrap();
            registry.insert(session("qa-1")).await.unwrap();
        }
        let registry = SessionRegistry::new(Some(path));
        let mut restored = registry.restore().await;
        restored.sort();
        assert_eq!(restored, vec!["dev-1".to_string(), "qa-1".to_string()]);
        assert!(registry.get("qa-1").await.is_some());
    }
}
