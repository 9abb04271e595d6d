//! File-backed task store.
//!
//! The canonical task store is an external service; this implementation
//! reads `<projectPath>/.agentmux/tasks.json` so the CLI works standalone.
//! A polling watcher reports tasks that flip to `done` on the completions
//! channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{TaskRecord, TaskStatus, TaskStore};

const WATCH_INTERVAL: Duration = Duration::from_secs(5);

pub struct JsonFileTaskStore {
    path: PathBuf,
    completions_tx: async_channel::Sender<TaskRecord>,
    completions_rx: async_channel::Receiver<TaskRecord>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl JsonFileTaskStore {
    pub fn new(path: PathBuf) -> Self {
        let (completions_tx, completions_rx) = async_channel::bounded(256);
        Self {
            path,
            completions_tx,
            completions_rx,
            watcher: Mutex::new(None),
        }
    }

    fn read_tasks(path: &PathBuf) -> Vec<TaskRecord> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("ignoring malformed task file {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Start watching the file for tasks transitioning to done.
    pub async fn start_watching(&self) {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            return;
        }
        let path = self.path.clone();
        let tx = self.completions_tx.clone();
        *watcher = Some(tokio::spawn(async move {
            let mut known: HashMap<String, TaskStatus> = Self::read_tasks(&path)
                .into_iter()
                .map(|t| (t.id.clone(), t.status))
                .collect();
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for task in Self::read_tasks(&path) {
                    let previous = known.insert(task.id.clone(), task.status);
                    if task.status == TaskStatus::Done && previous != Some(TaskStatus::Done) {
                        debug!("task '{}' completed externally", task.id);
                        if tx.send(task).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    pub async fn stop_watching(&self) {
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn get_all_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(Self::read_tasks(&self.path))
    }

    async fn get_tasks_for_team_member(&self, member_id: &str) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(Self::read_tasks(&self.path)
            .into_iter()
            .filter(|t| t.assignee.as_deref() == Some(member_id))
            .collect())
    }

    async fn get_all_in_progress_tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(Self::read_tasks(&self.path)
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect())
    }

    fn completions(&self) -> async_channel::Receiver<TaskRecord> {
        self.completions_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use chrono::Utc;

    fn write_tasks(path: &std::path::Path, tasks: &[TaskRecord]) {
        std::fs::write(path, serde_json::to_string_pretty(tasks).unwrap()).unwrap();
    }

    fn task(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: TaskPriority::Medium,
            assignee: None,
            created_at: Utc::now(),
            dependencies: Vec::new(),
            labels: Vec::new(),
            estimated_hours: None,
        }
    }

    #[tokio::test]
    async fn test_reads_tasks_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_tasks(
            &path,
            &[task("t1", TaskStatus::Open), task("t2", TaskStatus::InProgress)],
        );
        let store = JsonFileTaskStore::new(path);
        assert_eq!(store.get_all_tasks().await.unwrap().len(), 2);
        assert_eq!(store.get_all_in_progress_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileTaskStore::new(dir.path().join("absent.json"));
        assert!(store.get_all_tasks().await.unwrap().is_empty());
    }
}
