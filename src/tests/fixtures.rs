//! Shared test doubles: a scripted terminal backend, a recording
//! registration collaborator, and an in-memory task store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::backend::{
    BackendError, BackendResult, OutputSubscription, SessionBackend, SpawnedSession, TerminalKey,
};
use crate::context::{AgentRegistration, RegistrationRequest, RegistrationResponse};
use crate::task::{TaskPriority, TaskRecord, TaskStatus, TaskStore};

/// Terminal backend whose pane content follows a script of
/// `(offset, content)` steps against the tokio clock, and whose output
/// subscriptions are fed manually.
pub struct ScriptedBackend {
    started: tokio::time::Instant,
    sessions: DashMap<String, ()>,
    captures: DashMap<String, Vec<(Duration, String)>>,
    capture_calls: DashMap<String, usize>,
    feeds: DashMap<String, Vec<async_channel::Sender<String>>>,
    io_log: DashMap<String, Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: tokio::time::Instant::now(),
            sessions: DashMap::new(),
            captures: DashMap::new(),
            capture_calls: DashMap::new(),
            feeds: DashMap::new(),
            io_log: DashMap::new(),
        })
    }

    pub fn add_session(&self, name: &str) {
        self.sessions.insert(name.to_string(), ());
    }

    /// Pane content visible from `offset` after backend construction.
    pub fn script_capture(&self, name: &str, offset: Duration, content: &str) {
        self.captures
            .entry(name.to_string())
            .or_default()
            .push((offset, content.to_string()));
    }

    /// Feed a chunk to every output subscriber of the session.
    pub async fn push_output(&self, name: &str, chunk: &str) {
        if let Some(feed) = self.feeds.get(name).map(|f| f.value().clone()) {
            for tx in feed {
                let _ = tx.send(chunk.to_string()).await;
            }
        }
    }

    pub fn capture_count(&self, name: &str) -> usize {
        self.capture_calls.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn io_log(&self, name: &str) -> Vec<String> {
        self.io_log.get(name).map(|l| l.value().clone()).unwrap_or_default()
    }

    fn log(&self, name: &str, line: String) {
        self.io_log.entry(name.to_string()).or_default().push(line);
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn create_session(
        &self,
        name: &str,
        _cwd: &Path,
        _env: &HashMap<String, String>,
    ) -> BackendResult<SpawnedSession> {
        self.sessions.insert(name.to_string(), ());
        Ok(SpawnedSession { pid: Some(4242) })
    }

    async fn session_exists(&self, name: &str) -> BackendResult<bool> {
        Ok(self.sessions.contains_key(name))
    }

    async fn list_sessions(&self) -> BackendResult<Vec<String>> {
        Ok(self.sessions.iter().map(|e| e.key().clone()).collect())
    }

    async fn write(&self, name: &str, data: &str) -> BackendResult<()> {
        if !self.sessions.contains_key(name) {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        self.log(name, format!("write:{}", data));
        Ok(())
    }

    async fn send_key(&self, name: &str, key: TerminalKey) -> BackendResult<()> {
        if !self.sessions.contains_key(name) {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        self.log(name, format!("key:{:?}", key));
        Ok(())
    }

    async fn capture_pane(&self, name: &str, _lines: usize) -> BackendResult<String> {
        if !self.sessions.contains_key(name) {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        *self.capture_calls.entry(name.to_string()).or_insert(0) += 1;
        let elapsed = self.started.elapsed();
        let content = self
            .captures
            .get(name)
            .and_then(|steps| {
                steps
                    .iter()
                    .filter(|(offset, _)| *offset <= elapsed)
                    .last()
                    .map(|(_, content)| content.clone())
            })
            .unwrap_or_default();
        Ok(content)
    }

    fn subscribe_output(&self, name: &str) -> BackendResult<OutputSubscription> {
        let (tx, rx) = async_channel::bounded(64);
        self.feeds.entry(name.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn kill_session(&self, name: &str) -> BackendResult<()> {
        if self.sessions.remove(name).is_none() {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn clear_command_line(&self, name: &str) -> BackendResult<()> {
        self.send_key(name, TerminalKey::CtrlU).await
    }

    async fn set_env(&self, name: &str, _key: &str, _value: &str) -> BackendResult<()> {
        if !self.sessions.contains_key(name) {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }
}

/// Registration collaborator recording every rebuild request.
#[derive(Default)]
pub struct RecordingRegistration {
    pub calls: std::sync::Mutex<Vec<RegistrationRequest>>,
}

impl RecordingRegistration {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRegistration for RecordingRegistration {
    async fn create_agent_session(
        &self,
        request: RegistrationRequest,
    ) -> anyhow::Result<RegistrationResponse> {
        let session_name = request.session_name.clone();
        self.calls.lock().unwrap().push(request);
        Ok(RegistrationResponse {
            success: true,
            session_name,
        })
    }
}

/// In-memory task store with a manually driven completion feed.
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<TaskRecord>>,
    completions_tx: async_channel::Sender<TaskRecord>,
    completions_rx: async_channel::Receiver<TaskRecord>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<TaskRecord>) -> Arc<Self> {
        let (completions_tx, completions_rx) = async_channel::bounded(64);
        Arc::new(Self {
            tasks: Mutex::new(tasks),
            completions_tx,
            completions_rx,
        })
    }

    pub async fn set_status(&self, task_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
            task.status = status;
        }
    }

    pub async fn complete(&self, task_id: &str) -> TaskRecord {
        self.set_status(task_id, TaskStatus::Done).await;
        let record = self
            .tasks
            .lock()
            .await
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .expect("completed task exists");
        let _ = self.completions_tx.send(record.clone()).await;
        record
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_all_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.tasks.lock().await.clone())
    }

    async fn get_tasks_for_team_member(&self, member_id: &str) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.assignee.as_deref() == Some(member_id))
            .cloned()
            .collect())
    }

    async fn get_all_in_progress_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .cloned()
            .collect())
    }

    fn completions(&self) -> async_channel::Receiver<TaskRecord> {
        self.completions_rx.clone()
    }
}

/// A plain open task for queue tests.
pub fn open_task(id: &str, priority: TaskPriority, description: &str) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: format!("task {}", id),
        description: description.to_string(),
        status: TaskStatus::Open,
        priority,
        assignee: None,
        created_at: Utc::now(),
        dependencies: Vec::new(),
        labels: Vec::new(),
        estimated_hours: None,
    }
}
