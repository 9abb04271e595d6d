//! Auto-assignment of queued tasks to idle agents.
//!
//! The queue is a projection over open tasks, rebuilt atomically per
//! refresh. Assignment enforces, in order: registration, enablement,
//! concurrent-workload cap, per-agent cooldown, and the daily cap, then
//! matches the queue under role rules and dependency blocking. Delivery of
//! the task text is a collaborator contract; the core owns only the state
//! transition.

pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventKind};
use crate::task::{
    build_queue, Assignment, AssignmentStatus, QueuedTask, TaskRecord, TaskStore,
};

pub use config::{AutoAssignConfig, Prioritization};

/// Why no assignment happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoAssignmentReason {
    NoTasks,
    AllBlocked,
    RoleMismatch,
    RateLimited,
    Cooldown,
    DailyLimit,
    MaxConcurrent,
    Disabled,
}

impl NoAssignmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoAssignmentReason::NoTasks => "no_tasks",
            NoAssignmentReason::AllBlocked => "all_blocked",
            NoAssignmentReason::RoleMismatch => "role_mismatch",
            NoAssignmentReason::RateLimited => "rate_limited",
            NoAssignmentReason::Cooldown => "cooldown",
            NoAssignmentReason::DailyLimit => "daily_limit",
            NoAssignmentReason::MaxConcurrent => "max_concurrent",
            NoAssignmentReason::Disabled => "disabled",
        }
    }
}

/// Outcome of one assignment attempt.
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    Assigned(Assignment),
    Skipped(NoAssignmentReason),
}

/// Collaborator that delivers an assigned task into the agent's terminal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskDelivery: Send + Sync {
    async fn deliver(&self, session_name: &str, task: &TaskRecord) -> anyhow::Result<()>;
}

/// Roles allowed to stand in for another role when a task pins one.
fn role_substitutes(role: &str) -> &'static [&'static str] {
    match role {
        "frontend-developer" => &["developer"],
        "backend-developer" => &["developer"],
        "qa" => &["tester"],
        _ => &[],
    }
}

/// One registered agent.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_id: String,
    pub role: String,
    pub project_path: PathBuf,
    pub preferred_task_types: Vec<String>,
}

#[derive(Debug, Clone)]
struct AgentState {
    workload: u32,
    last_assignment_ms: Option<i64>,
    daily_count: u32,
    daily_date: chrono::NaiveDate,
}

impl AgentState {
    fn fresh() -> Self {
        Self {
            workload: 0,
            last_assignment_ms: None,
            daily_count: 0,
            daily_date: Utc::now().date_naive(),
        }
    }
}

struct ProjectState {
    config: AutoAssignConfig,
    queue: Vec<QueuedTask>,
    records: std::collections::HashMap<String, TaskRecord>,
    assignments: Vec<Assignment>,
    paused: bool,
}

pub struct AutoAssigner {
    store: Arc<dyn TaskStore>,
    delivery: Arc<dyn TaskDelivery>,
    events: EventBus,
    projects: DashMap<PathBuf, ProjectState>,
    agents: DashMap<String, AgentProfile>,
    agent_state: DashMap<String, AgentState>,
    completion_loop: Mutex<Option<JoinHandle<()>>>,
}

impl AutoAssigner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        delivery: Arc<dyn TaskDelivery>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            delivery,
            events,
            projects: DashMap::new(),
            agents: DashMap::new(),
            agent_state: DashMap::new(),
            completion_loop: Mutex::new(None),
        })
    }

    /// Register a project and build its first queue.
    pub async fn register_project(&self, project_path: PathBuf) {
        let config = AutoAssignConfig::load(&project_path);
        self.projects.insert(
            project_path.clone(),
            ProjectState {
                config,
                queue: Vec::new(),
                records: std::collections::HashMap::new(),
                assignments: Vec::new(),
                paused: false,
            },
        );
        self.refresh_queue(&project_path).await;
    }

    pub fn has_project(&self, project_path: &PathBuf) -> bool {
        self.projects.contains_key(project_path)
    }

    pub fn register_agent(&self, session_name: &str, profile: AgentProfile) {
        self.agents.insert(session_name.to_string(), profile);
    }

    pub fn deregister_agent(&self, session_name: &str) {
        self.agents.remove(session_name);
        self.agent_state.remove(session_name);
    }

    pub fn set_paused(&self, project_path: &PathBuf, paused: bool) {
        if let Some(mut state) = self.projects.get_mut(project_path) {
            state.paused = paused;
        }
    }

    /// Rebuild a project's queue from the task store and swap it in whole.
    pub async fn refresh_queue(&self, project_path: &PathBuf) {
        let tasks = match self.store.get_all_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("queue refresh failed for {}: {:#}", project_path.display(), e);
                return;
            }
        };
        let queue = build_queue(&tasks);
        let records = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        if let Some(mut state) = self.projects.get_mut(project_path) {
            state.queue = queue;
            state.records = records;
            debug!(
                "queue refreshed for {}: {} open task(s)",
                project_path.display(),
                state.queue.len()
            );
        }
    }

    /// Pick the next eligible task for an agent, or the reason there is
    /// none.
    pub fn find_next_task(
        &self,
        project_path: &PathBuf,
        role: &str,
        preferred_task_types: &[String],
    ) -> Result<QueuedTask, NoAssignmentReason> {
        let state = self
            .projects
            .get(project_path)
            .ok_or(NoAssignmentReason::NoTasks)?;
        if state.queue.is_empty() {
            return Err(NoAssignmentReason::NoTasks);
        }

        // Tasks already bound to a session, and failed ones awaiting an
        // operator re-open, are not handed out again.
        let withheld_tasks: std::collections::HashSet<&str> = state
            .assignments
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    AssignmentStatus::Active | AssignmentStatus::Failed
                )
            })
            .map(|a| a.task_id.as_str())
            .collect();

        let respect_blocking = state.config.strategy.dependencies.respect_blocking;
        let mut rejected_blocked = 0usize;
        let mut eligible: Vec<QueuedTask> = Vec::new();
        for task in &state.queue {
            if withheld_tasks.contains(task.task_id.as_str()) {
                continue;
            }
            if let Some(required) = &task.required_role {
                if required != role && !role_substitutes(role).contains(&required.as_str()) {
                    continue;
                }
            }
            if let Some(task_type) = &task.task_type {
                let listed = state
                    .config
                    .rule_for(role)
                    .map(|rule| rule.task_types.iter().any(|t| t == task_type))
                    .unwrap_or(false);
                if !listed {
                    continue;
                }
                if state.config.exclusively_claimed_by_other(role, task_type) {
                    continue;
                }
            }
            if respect_blocking && !task.blocked_by.is_empty() {
                rejected_blocked += 1;
                continue;
            }
            eligible.push(task.clone());
        }

        if eligible.is_empty() {
            return Err(if rejected_blocked > 0 {
                NoAssignmentReason::AllBlocked
            } else {
                NoAssignmentReason::RoleMismatch
            });
        }

        let prioritization = state.config.strategy.prioritization;
        drop(state);
        sort_eligible(&mut eligible, prioritization, preferred_task_types);
        Ok(eligible.remove(0))
    }

    /// Assign the next task to a session, enforcing rate limits in order.
    pub async fn assign_next_task(&self, session_name: &str) -> AssignOutcome {
        let Some(profile) = self.agents.get(session_name).map(|p| p.value().clone()) else {
            debug!("no project registered for session '{}'", session_name);
            return AssignOutcome::Skipped(NoAssignmentReason::Disabled);
        };

        // Enablement and pause state.
        {
            let Some(state) = self.projects.get(&profile.project_path) else {
                return AssignOutcome::Skipped(NoAssignmentReason::Disabled);
            };
            if !state.config.enabled {
                return AssignOutcome::Skipped(NoAssignmentReason::Disabled);
            }
            if state.paused {
                return AssignOutcome::Skipped(NoAssignmentReason::RateLimited);
            }
        }

        let (max_concurrent, cooldown_sec, max_daily) = {
            let state = self.projects.get(&profile.project_path).expect("checked");
            (
                state.config.strategy.load_balancing.max_concurrent_tasks,
                state.config.limits.cooldown_between_tasks,
                state.config.limits.max_assignments_per_day,
            )
        };

        let now_ms = Utc::now().timestamp_millis();
        let today = Utc::now().date_naive();
        {
            let mut agent = self
                .agent_state
                .entry(session_name.to_string())
                .or_insert_with(AgentState::fresh);
            if agent.daily_date != today {
                agent.daily_date = today;
                agent.daily_count = 0;
            }
            if agent.workload >= max_concurrent {
                return AssignOutcome::Skipped(NoAssignmentReason::MaxConcurrent);
            }
            if let Some(last) = agent.last_assignment_ms {
                if now_ms - last < (cooldown_sec as i64) * 1000 {
                    return AssignOutcome::Skipped(NoAssignmentReason::Cooldown);
                }
            }
            if agent.daily_count >= max_daily {
                self.events.publish(
                    Event::new(EventKind::DailyLimit)
                        .with_session(session_name)
                        .with_agent(profile.agent_id.clone()),
                );
                return AssignOutcome::Skipped(NoAssignmentReason::DailyLimit);
            }
        }

        let found = self.find_next_task(
            &profile.project_path,
            &profile.role,
            &profile.preferred_task_types,
        );
        let task = match found {
            Ok(task) => task,
            Err(reason) => {
                if reason == NoAssignmentReason::NoTasks {
                    self.events.publish(
                        Event::new(EventKind::NoTasks)
                            .with_session(session_name)
                            .with_agent(profile.agent_id.clone()),
                    );
                }
                return AssignOutcome::Skipped(reason);
            }
        };

        let assignment = Assignment {
            task_id: task.task_id.clone(),
            agent_id: profile.agent_id.clone(),
            session_name: session_name.to_string(),
            assigned_at: Utc::now(),
            status: AssignmentStatus::Active,
            completed_at: None,
        };
        let record = {
            let mut state = self.projects.get_mut(&profile.project_path).expect("checked");
            state.assignments.push(assignment.clone());
            state.records.get(&task.task_id).cloned()
        };
        {
            let mut agent = self
                .agent_state
                .entry(session_name.to_string())
                .or_insert_with(AgentState::fresh);
            agent.workload += 1;
            agent.last_assignment_ms = Some(now_ms);
            agent.daily_count += 1;
        }

        info!(
            "assigned task '{}' to '{}' ({})",
            assignment.task_id, session_name, profile.role
        );
        self.events.publish(
            Event::new(EventKind::TaskAssigned)
                .with_task(assignment.task_id.clone())
                .with_session(session_name)
                .with_agent(profile.agent_id.clone()),
        );

        self.refresh_queue(&profile.project_path).await;

        if let Some(record) = record {
            if let Err(e) = self.delivery.deliver(session_name, &record).await {
                warn!(
                    "delivery of task '{}' to '{}' failed: {:#}",
                    record.id, session_name, e
                );
                self.events.publish(
                    Event::new(EventKind::AssignmentError)
                        .with_task(record.id.clone())
                        .with_session(session_name)
                        .with_metadata(serde_json::json!({ "error": e.to_string() })),
                );
            }
        } else {
            self.events.publish(
                Event::new(EventKind::AssignmentError)
                    .with_task(assignment.task_id.clone())
                    .with_session(session_name)
                    .with_metadata(serde_json::json!({ "error": "task not found in store" })),
            );
        }

        AssignOutcome::Assigned(assignment)
    }

    /// Handle an externally reported completion: close the active
    /// assignment, then try to hand the agent its next task.
    pub async fn handle_task_completed(&self, task: &TaskRecord) {
        let mut completed_session: Option<String> = None;
        for mut state in self.projects.iter_mut() {
            if let Some(assignment) = state
                .assignments
                .iter_mut()
                .find(|a| a.task_id == task.id && a.status == AssignmentStatus::Active)
            {
                assignment.status = AssignmentStatus::Completed;
                assignment.completed_at = Some(Utc::now());
                completed_session = Some(assignment.session_name.clone());
                break;
            }
        }
        let Some(session_name) = completed_session else {
            debug!("completion for task '{}' matched no active assignment", task.id);
            return;
        };
        if let Some(mut agent) = self.agent_state.get_mut(&session_name) {
            agent.workload = agent.workload.saturating_sub(1);
        }
        self.events.publish(
            Event::new(EventKind::TaskCompleted)
                .with_task(task.id.clone())
                .with_session(session_name.clone()),
        );
        // The completion may have unblocked dependents; rebuild before
        // looking for the agent's next task.
        if let Some(project) = self
            .agents
            .get(&session_name)
            .map(|p| p.project_path.clone())
        {
            self.refresh_queue(&project).await;
        }
        self.assign_next_task(&session_name).await;
    }

    /// Transition an assignment to failed. No automatic retry.
    pub fn mark_task_failed(&self, task_id: &str, session_name: &str, reason: &str) {
        for mut state in self.projects.iter_mut() {
            if let Some(assignment) = state.assignments.iter_mut().find(|a| {
                a.task_id == task_id
                    && a.session_name == session_name
                    && a.status == AssignmentStatus::Active
            }) {
                assignment.status = AssignmentStatus::Failed;
                assignment.completed_at = Some(Utc::now());
                break;
            }
        }
        if let Some(mut agent) = self.agent_state.get_mut(session_name) {
            agent.workload = agent.workload.saturating_sub(1);
        }
        self.events.publish(
            Event::new(EventKind::TaskFailed)
                .with_task(task_id)
                .with_session(session_name)
                .with_metadata(serde_json::json!({ "reason": reason })),
        );
    }

    /// Spawn the loop consuming the task store's completion feed.
    pub async fn start_completion_loop(self: &Arc<Self>) {
        let mut slot = self.completion_loop.lock().await;
        if slot.is_some() {
            return;
        }
        let assigner = Arc::clone(self);
        let rx = self.store.completions();
        *slot = Some(tokio::spawn(async move {
            while let Ok(task) = rx.recv().await {
                assigner.handle_task_completed(&task).await;
            }
        }));
    }

    pub async fn stop_completion_loop(&self) {
        if let Some(handle) = self.completion_loop.lock().await.take() {
            handle.abort();
        }
    }

    /// All assignments recorded for a project.
    pub fn assignments(&self, project_path: &PathBuf) -> Vec<Assignment> {
        self.projects
            .get(project_path)
            .map(|s| s.assignments.clone())
            .unwrap_or_default()
    }
}

fn sort_eligible(
    eligible: &mut [QueuedTask],
    prioritization: Prioritization,
    preferred_task_types: &[String],
) {
    let preferred = |task: &QueuedTask| -> bool {
        task.task_type
            .as_ref()
            .map(|t| preferred_task_types.iter().any(|p| p == t))
            .unwrap_or(false)
    };
    eligible.sort_by(|a, b| {
        preferred(b).cmp(&preferred(a)).then_with(|| match prioritization {
            Prioritization::Priority => a.priority.cmp(&b.priority),
            Prioritization::Fifo => a.created_at.cmp(&b.created_at),
            Prioritization::Deadline => a
                .estimated_hours
                .unwrap_or(f32::INFINITY)
                .partial_cmp(&b.estimated_hours.unwrap_or(f32::INFINITY))
                .unwrap_or(std::cmp::Ordering::Equal),
        })
    });
}
