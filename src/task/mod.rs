//! Task records, queue projections, and the task-store contract.
//!
//! The task store is an external collaborator; the core consumes it
//! read-mostly and records assignments separately. Descriptions may embed
//! structured hints (`depends on:`, `estimated:`, `labels:`) that the queue
//! builder extracts.

pub mod file_store;

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Status of a task in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
    Failed,
}

/// Task priority. Lower numeric value means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
    Backlog,
}

impl TaskPriority {
    pub fn numeric(&self) -> u8 {
        match self {
            TaskPriority::Critical => 1,
            TaskPriority::High => 2,
            TaskPriority::Medium => 3,
            TaskPriority::Low => 4,
            TaskPriority::Backlog => 5,
        }
    }
}

/// A task as supplied by the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Role the task is pinned to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f32>,
}

/// Queue projection of one open task.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: String,
    pub required_role: Option<String>,
    pub task_type: Option<String>,
    pub dependencies: Vec<String>,
    /// Dependencies still open or in progress.
    pub blocked_by: Vec<String>,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub estimated_hours: Option<f32>,
}

/// Status of one task-to-session binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Completed,
    Failed,
}

/// One task-to-session binding. Appended once; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub task_id: String,
    pub agent_id: String,
    pub session_name: String,
    pub assigned_at: DateTime<Utc>,
    pub status: AssignmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The external task store. The core never writes task status back;
/// completion arrives on the `completions` channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_all_tasks(&self) -> anyhow::Result<Vec<TaskRecord>>;

    async fn get_tasks_for_team_member(&self, member_id: &str) -> anyhow::Result<Vec<TaskRecord>>;

    async fn get_all_in_progress_tasks(&self) -> anyhow::Result<Vec<TaskRecord>>;

    /// Stream of externally reported task completions.
    fn completions(&self) -> async_channel::Receiver<TaskRecord>;
}

/// Structured hints extracted from a task description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptionHints {
    pub depends_on: Vec<String>,
    pub estimated_hours: Option<f32>,
    pub labels: Vec<String>,
}

static DEPENDS_ON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*depends\s+on:\s*(.+)$").expect("depends regex"));
static ESTIMATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*estimated:\s*(\d+(?:\.\d+)?)\s*h\b").expect("estimated regex")
});
static LABELS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*labels:\s*(.+)$").expect("labels regex"));

/// Extract the optional hints from a description.
pub fn parse_description_hints(description: &str) -> DescriptionHints {
    let mut hints = DescriptionHints::default();
    if let Some(captures) = DEPENDS_ON.captures(description) {
        hints.depends_on = split_list(&captures[1]);
    }
    if let Some(captures) = ESTIMATED.captures(description) {
        hints.estimated_hours = captures[1].parse().ok();
    }
    if let Some(captures) = LABELS.captures(description) {
        hints.labels = split_list(&captures[1]);
    }
    hints
}

/// Task type carried as a `type:<name>` label, if present.
pub fn task_type_from_labels(labels: &[String]) -> Option<String> {
    labels
        .iter()
        .find_map(|label| label.strip_prefix("type:"))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Build the queue projection from the full task list.
pub fn build_queue(tasks: &[TaskRecord]) -> Vec<QueuedTask> {
    let mut queue = Vec::new();
    for task in tasks {
        if task.status != TaskStatus::Open {
            continue;
        }
        let hints = parse_description_hints(&task.description);
        let mut dependencies = task.dependencies.clone();
        for dep in &hints.depends_on {
            if !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }
        let blocked_by: Vec<String> = dependencies
            .iter()
            .filter(|dep| {
                tasks.iter().any(|t| {
                    &t.id == *dep
                        && matches!(t.status, TaskStatus::Open | TaskStatus::InProgress)
                })
            })
            .cloned()
            .collect();
        let mut labels = task.labels.clone();
        labels.extend(hints.labels.iter().cloned());
        queue.push(QueuedTask {
            task_id: task.id.clone(),
            required_role: task.assignee.clone(),
            task_type: task_type_from_labels(&labels),
            dependencies,
            blocked_by,
            priority: task.priority.numeric(),
            created_at: task.created_at,
            estimated_hours: task.estimated_hours.or(hints.estimated_hours),
        });
    }
    queue
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, priority: TaskPriority) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            title: format!("task {}", id),
            description: String::new(),
            status,
            priority,
            assignee: None,
            created_at: Utc::now(),
            dependencies: Vec::new(),
            labels: Vec::new(),
            estimated_hours: None,
        }
    }

    #[test]
    fn test_parse_description_hints() {
        let hints = parse_description_hints(
            "Build the login page.\ndepends on: t1, t2 ,t3\nestimated: 8h\nlabels: ui, type:feature",
        );
        assert_eq!(hints.depends_on, vec!["t1", "t2", "t3"]);
        assert_eq!(hints.estimated_hours, Some(8.0));
        assert_eq!(hints.labels, vec!["ui", "type:feature"]);
    }

    #[test]
    fn test_hints_absent_yield_defaults() {
        assert_eq!(
            parse_description_hints("just a plain description"),
            DescriptionHints::default()
        );
    }

    #[test]
    fn test_task_type_from_labels() {
        let labels = vec!["ui".to_string(), "type:testing".to_string()];
        assert_eq!(task_type_from_labels(&labels), Some("testing".to_string()));
        assert_eq!(task_type_from_labels(&["ui".to_string()]), None);
    }

    #[test]
    fn test_build_queue_keeps_only_open_tasks() {
        let tasks = vec![
            task("t1", TaskStatus::Open, TaskPriority::High),
            task("t2", TaskStatus::Done, TaskPriority::Critical),
            task("t3", TaskStatus::InProgress, TaskPriority::Low),
        ];
        let queue = build_queue(&tasks);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].task_id, "t1");
        assert_eq!(queue[0].priority, 2);
    }

    #[test]
    fn test_blocked_by_excludes_done_dependencies() {
        let mut t1 = task("t1", TaskStatus::Done, TaskPriority::High);
        t1.id = "t1".to_string();
        let t2 = task("t2", TaskStatus::InProgress, TaskPriority::High);
        let mut t3 = task("t3", TaskStatus::Open, TaskPriority::Medium);
        t3.dependencies = vec!["t1".to_string(), "t2".to_string(), "ghost".to_string()];
        let queue = build_queue(&[t1, t2, t3]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].blocked_by, vec!["t2".to_string()]);
    }

    #[test]
    fn test_dependency_hints_merge_with_declared_dependencies() {
        let t1 = task("t1", TaskStatus::Open, TaskPriority::High);
        let mut t2 = task("t2", TaskStatus::Open, TaskPriority::High);
        t2.description = "depends on: t1".to_string();
        let queue = build_queue(&[t1, t2]);
        let q2 = queue.iter().find(|q| q.task_id == "t2").unwrap();
        assert_eq!(q2.dependencies, vec!["t1".to_string()]);
        assert_eq!(q2.blocked_by, vec!["t1".to_string()]);
    }
}
