//! Typed pub/sub event bus.
//!
//! Delivery is at-most-once per `(topic, subscriber)`: the bus is a tokio
//! broadcast channel, so a lagging subscriber loses the oldest events rather
//! than exerting back-pressure on publishers. Designed for observability,
//! not transactional delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const BUS_CAPACITY: usize = 1024;

/// Every event kind published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ContextWarning,
    ContextCritical,
    SessionExited,
    SessionMissing,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    NoTasks,
    AgentIdle,
    BudgetWarning,
    BudgetExceeded,
    RecoverySuppressed,
    DailyLimit,
    BufferCapped,
    AssignmentError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContextWarning => "context_warning",
            EventKind::ContextCritical => "context_critical",
            EventKind::SessionExited => "session_exited",
            EventKind::SessionMissing => "session_missing",
            EventKind::TaskAssigned => "task_assigned",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::NoTasks => "no_tasks",
            EventKind::AgentIdle => "agent_idle",
            EventKind::BudgetWarning => "budget_warning",
            EventKind::BudgetExceeded => "budget_exceeded",
            EventKind::RecoverySuppressed => "recovery_suppressed",
            EventKind::DailyLimit => "daily_limit",
            EventKind::BufferCapped => "buffer_capped",
            EventKind::AssignmentError => "assignment_error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat event payload published to collaborators (chat, notifications, UI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            agent_id: None,
            session_name: None,
            team_id: None,
            member_id: None,
            task_id: None,
            changed_field: None,
            previous_value: None,
            new_value: None,
            metadata: None,
        }
    }

    pub fn with_session(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = Some(session_name.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_team(mut self, team_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self.member_id = Some(member_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_change(
        mut self,
        field: impl Into<String>,
        previous: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        self.changed_field = Some(field.into());
        self.previous_value = Some(previous.into());
        self.new_value = Some(new.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Process-wide event bus handle. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers drops the event silently.
    pub fn publish(&self, event: Event) {
        tracing::debug!(kind = %event.kind, session = ?event.session_name, "event published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
