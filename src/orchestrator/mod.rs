//! The control kernel.
//!
//! Owns the session registry, wires the monitors, the budget meter, the
//! assigner, and the fleet publisher together, and drives session life
//! cycle from creation through readiness to termination. Everything here
//! composes the leaf subsystems; the kernel adds no protocol of its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assign::{AgentProfile, AutoAssigner, TaskDelivery};
use crate::backend::{SessionBackend, TerminalKey};
use crate::budget::BudgetMeter;
use crate::config::{
    Settings, ENV_AGENT_ROLE, ENV_AGENT_ROLE_ALIAS, ENV_PROJECT_PATH, ENV_SESSION_NAME,
};
use crate::context::{
    AgentRegistration, ContextWindowMonitor, RegistrationRequest, RegistrationResponse,
};
use crate::events::{Event, EventBus, EventKind};
use crate::fleet::{
    FleetAgent, FleetPublisher, FleetSnapshot, FleetStats, SnapshotSource,
};
use crate::runtime::detection::RuntimeDetector;
use crate::runtime::init_script::{execute_runtime_init_script, post_initialize};
use crate::runtime::readiness::wait_for_runtime_ready;
use crate::runtime::{RuntimeKind, RuntimeRegistry};
use crate::session::activity::ActivityTracker;
use crate::session::exit_monitor::ExitMonitor;
use crate::session::{Session, SessionRegistry, SessionStatus, WorkingStatus};
use crate::task::{TaskRecord, TaskStore};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Delay before a rebuilt session's context monitoring is reattached,
/// letting the recovery path finish tearing the old monitoring down.
const MONITOR_REATTACH_DELAY: Duration = Duration::from_secs(2);

/// Per-session CPU usage source. The default reports nothing; real
/// samplers are a host concern.
pub trait CpuSampler: Send + Sync {
    fn sample(&self, session: &Session) -> f32;
}

pub struct NullCpuSampler;

impl CpuSampler for NullCpuSampler {
    fn sample(&self, _session: &Session) -> f32 {
        0.0
    }
}

/// Everything needed to bring a new agent session up.
#[derive(Debug, Clone)]
pub struct NewSessionSpec {
    pub session_name: String,
    pub agent_id: String,
    pub role: String,
    pub team_id: String,
    pub project_path: PathBuf,
    pub runtime_kind: RuntimeKind,
    pub runtime_flags: Vec<String>,
    pub prompt_file: Option<PathBuf>,
    pub preferred_task_types: Vec<String>,
}

/// Snapshot producer backed by the registry plus the metering subsystems.
struct FleetSnapshotter {
    registry: Arc<SessionRegistry>,
    activity: Arc<ActivityTracker>,
    budget: Arc<BudgetMeter>,
    cpu: Arc<dyn CpuSampler>,
}

#[async_trait]
impl SnapshotSource for FleetSnapshotter {
    async fn fleet_snapshot(&self) -> Result<FleetSnapshot> {
        let sessions = self.registry.list().await;
        let mut agents = Vec::with_capacity(sessions.len());
        let mut stats = FleetStats::default();
        let mut projects: Vec<String> = Vec::new();
        for session in &sessions {
            let status = match (session.status, session.working_status) {
                (SessionStatus::Active, WorkingStatus::InProgress) => "active",
                (SessionStatus::Active, WorkingStatus::Idle) => "idle",
                _ => "dormant",
            };
            match status {
                "active" => stats.active_count += 1,
                "idle" => stats.idle_count += 1,
                _ => stats.dormant_count += 1,
            }
            let tokens = self.budget.session_tokens_today(&session.session_name);
            stats.total_tokens += tokens;
            let project_name = session
                .project_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string());
            if let Some(name) = &project_name {
                if !projects.contains(name) {
                    projects.push(name.clone());
                }
            }
            let idle_ms = self.activity.idle_time_ms(&session.session_name);
            agents.push(FleetAgent {
                id: session.agent_id.clone(),
                session_name: session.session_name.clone(),
                role: session.role.clone(),
                project_name,
                status: status.to_string(),
                cpu_percent: self.cpu.sample(session),
                session_tokens: tokens,
                activity: (idle_ms > 0).then(|| format!("idle {}s", idle_ms / 1000)),
            });
        }
        projects.sort();
        Ok(FleetSnapshot {
            timestamp: Utc::now(),
            agents,
            projects,
            stats,
        })
    }
}

/// Delivers assigned tasks into the agent's terminal and flips the session
/// to in-progress.
struct TerminalTaskDelivery {
    backend: Arc<dyn SessionBackend>,
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl TaskDelivery for TerminalTaskDelivery {
    async fn deliver(&self, session_name: &str, task: &TaskRecord) -> Result<()> {
        let brief = if task.description.is_empty() {
            format!("[Task {}] {}", task.id, task.title)
        } else {
            format!("[Task {}] {}\n\n{}", task.id, task.title, task.description)
        };
        self.backend
            .clear_command_line(session_name)
            .await
            .with_context(|| format!("Failed to clear command line in '{}'", session_name))?;
        self.backend
            .write(session_name, &brief)
            .await
            .with_context(|| format!("Failed to write task brief to '{}'", session_name))?;
        self.backend
            .send_key(session_name, TerminalKey::Enter)
            .await
            .with_context(|| format!("Failed to submit task brief to '{}'", session_name))?;
        let _ = self
            .registry
            .set_working_status(session_name, WorkingStatus::InProgress)
            .await;
        Ok(())
    }
}

/// Registration collaborator that rebuilds a session in place. Used by the
/// context monitor's recovery path.
struct SessionRebuilder {
    backend: Arc<dyn SessionBackend>,
    registry: Arc<SessionRegistry>,
    runtimes: Arc<RuntimeRegistry>,
    exit_monitor: Arc<ExitMonitor>,
    settings: Settings,
    monitor: OnceLock<Weak<ContextWindowMonitor>>,
}

#[async_trait]
impl AgentRegistration for SessionRebuilder {
    async fn create_agent_session(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse> {
        let name = request.session_name.clone();
        let session = self
            .registry
            .get(&name)
            .await
            .ok_or_else(|| anyhow::anyhow!("session '{}' not in registry", name))?;
        let adapter = self
            .runtimes
            .get(session.runtime_kind)
            .ok_or_else(|| anyhow::anyhow!("no adapter for {}", session.runtime_kind))?;

        if self.backend.session_exists(&name).await? {
            self.backend.kill_session(&name).await?;
        }
        self.registry.reset_for_recovery(&name).await?;

        let env = session_env(&name, &session.role, &session.project_path);
        self.backend
            .create_session(&name, &session.project_path, &env)
            .await?;
        execute_runtime_init_script(
            self.backend.as_ref(),
            &self.settings,
            &adapter,
            &self.runtimes.script_path(&adapter),
            &name,
            &session.project_path,
            &[],
            None,
        )
        .await?;
        self.registry.set_status(&name, SessionStatus::Started).await?;

        let ready = wait_for_runtime_ready(
            self.backend.as_ref(),
            &adapter,
            &name,
            adapter.ready_timeout,
            READINESS_POLL_INTERVAL,
        )
        .await;
        if ready {
            self.registry.set_status(&name, SessionStatus::Active).await?;
            post_initialize(self.backend.as_ref(), &adapter, &name).await?;
        }
        self.exit_monitor
            .start_watch(&name, &session.agent_id, adapter.exit_patterns())?;

        // Monitoring reattaches after the recovery path finishes removing
        // the old subscription.
        if let Some(weak) = self.monitor.get() {
            if let Some(monitor) = weak.upgrade() {
                let target = request.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(MONITOR_REATTACH_DELAY).await;
                    if let Err(e) = monitor
                        .start_session_monitoring(
                            &target.session_name,
                            &target.member_id,
                            &target.team_id,
                            &target.role,
                        )
                        .await
                    {
                        warn!(
                            "could not reattach context monitoring for '{}': {:#}",
                            target.session_name, e
                        );
                    }
                });
            }
        }

        Ok(RegistrationResponse {
            success: ready,
            session_name: name,
        })
    }
}

fn session_env(name: &str, role: &str, project_path: &Path) -> HashMap<String, String> {
    HashMap::from([
        (
            ENV_PROJECT_PATH.to_string(),
            project_path.to_string_lossy().to_string(),
        ),
        (ENV_AGENT_ROLE.to_string(), role.to_string()),
        (ENV_AGENT_ROLE_ALIAS.to_string(), role.to_string()),
        (ENV_SESSION_NAME.to_string(), name.to_string()),
    ])
}

pub struct Orchestrator {
    settings: Settings,
    home: PathBuf,
    backend: Arc<dyn SessionBackend>,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    activity: Arc<ActivityTracker>,
    exit_monitor: Arc<ExitMonitor>,
    context_monitor: Arc<ContextWindowMonitor>,
    budget: Arc<BudgetMeter>,
    assigner: Arc<AutoAssigner>,
    fleet: Arc<FleetPublisher>,
    runtimes: Arc<RuntimeRegistry>,
    detector: Arc<RuntimeDetector>,
    snapshotter: Arc<FleetSnapshotter>,
    shutdown: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Assemble the kernel. `home` is the agentmux home directory,
    /// `project_root` the directory holding `config/`.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        task_store: Arc<dyn TaskStore>,
        home: &Path,
        project_root: &Path,
    ) -> Arc<Self> {
        let settings = Settings::load(home);
        let events = EventBus::new();
        let registry = Arc::new(SessionRegistry::new(Some(home.join("sessions.json"))));
        let activity = Arc::new(ActivityTracker::new());
        let exit_monitor = Arc::new(ExitMonitor::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            events.clone(),
        ));
        let runtimes =
            Arc::new(RuntimeRegistry::builtin(project_root).with_config_file(project_root));
        let detector = Arc::new(RuntimeDetector::new(Arc::clone(&backend)));
        let budget = Arc::new(BudgetMeter::new(home, events.clone()));
        let cpu: Arc<dyn CpuSampler> = Arc::new(NullCpuSampler);
        let snapshotter = Arc::new(FleetSnapshotter {
            registry: Arc::clone(&registry),
            activity: Arc::clone(&activity),
            budget: Arc::clone(&budget),
            cpu,
        });
        let fleet = FleetPublisher::new(
            Arc::clone(&snapshotter) as Arc<dyn SnapshotSource>,
            Duration::from_millis(settings.fleet.poll_interval_ms),
            Duration::from_millis(settings.fleet.heartbeat_interval_ms),
        );
        let rebuilder = Arc::new(SessionRebuilder {
            backend: Arc::clone(&backend),
            registry: Arc::clone(&registry),
            runtimes: Arc::clone(&runtimes),
            exit_monitor: Arc::clone(&exit_monitor),
            settings: settings.clone(),
            monitor: OnceLock::new(),
        });
        let context_monitor = ContextWindowMonitor::new(
            Arc::clone(&backend),
            events.clone(),
            Arc::clone(&activity),
            Arc::clone(&exit_monitor),
            Arc::clone(&rebuilder) as Arc<dyn AgentRegistration>,
            settings.context.clone(),
        );
        let _ = rebuilder.monitor.set(Arc::downgrade(&context_monitor));
        context_monitor.attach_fleet(Arc::clone(&fleet));
        let delivery = Arc::new(TerminalTaskDelivery {
            backend: Arc::clone(&backend),
            registry: Arc::clone(&registry),
        });
        let assigner = AutoAssigner::new(task_store, delivery, events.clone());
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            settings,
            home: home.to_path_buf(),
            backend,
            registry,
            events,
            activity,
            exit_monitor,
            context_monitor,
            budget,
            assigner,
            fleet,
            runtimes,
            detector,
            snapshotter,
            shutdown,
            watchdog: Mutex::new(None),
        })
    }

    /// Bring the kernel up: restore persisted sessions, reattach monitors
    /// for the ones the backend still knows, start the periodic loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let restored = self.registry.restore().await;
        for name in restored {
            let Some(session) = self.registry.get(&name).await else {
                continue;
            };
            let alive = self.backend.session_exists(&name).await.unwrap_or(false);
            if !alive {
                warn!("dropping persisted session '{}': backend no longer has it", name);
                self.registry.remove(&name).await;
                self.events
                    .publish(Event::new(EventKind::SessionMissing).with_session(&name));
                continue;
            }
            info!("reattaching monitors for persisted session '{}'", name);
            if let Some(adapter) = self.runtimes.get(session.runtime_kind) {
                if let Err(e) = self.exit_monitor.start_watch(
                    &name,
                    &session.agent_id,
                    adapter.exit_patterns(),
                ) {
                    warn!("exit watch for '{}' failed: {:#}", name, e);
                }
            }
            if let Err(e) = self
                .context_monitor
                .start_session_monitoring(&name, &session.agent_id, &session.team_id, &session.role)
                .await
            {
                warn!("context monitoring for '{}' failed: {:#}", name, e);
            }
            self.activity.record_activity(&name);
            if !self.assigner.has_project(&session.project_path) {
                self.assigner.register_project(session.project_path.clone()).await;
            }
            self.assigner.register_agent(
                &name,
                AgentProfile {
                    agent_id: session.agent_id.clone(),
                    role: session.role.clone(),
                    project_path: session.project_path.clone(),
                    preferred_task_types: Vec::new(),
                },
            );
        }

        self.context_monitor.start();
        self.assigner.start_completion_loop().await;
        self.spawn_idle_watchdog().await;
        info!("agentmux kernel started");
        Ok(())
    }

    /// Create, initialize, and monitor a new agent session.
    pub async fn create_session(self: &Arc<Self>, spec: NewSessionSpec) -> Result<bool> {
        let adapter = self
            .runtimes
            .get(spec.runtime_kind)
            .ok_or_else(|| anyhow::anyhow!("no adapter for {}", spec.runtime_kind))?;

        let mut session = Session::new(
            spec.session_name.clone(),
            spec.agent_id.clone(),
            spec.role.clone(),
            spec.team_id.clone(),
            spec.project_path.clone(),
            spec.runtime_kind,
        );
        session.status = SessionStatus::Starting;
        self.registry.insert(session).await?;

        let env = session_env(&spec.session_name, &spec.role, &spec.project_path);
        self.backend
            .create_session(&spec.session_name, &spec.project_path, &env)
            .await
            .with_context(|| format!("Failed to create session '{}'", spec.session_name))?;

        let prompt_file = match &spec.prompt_file {
            Some(template) => Some(self.render_prompt_file(&spec, template)?),
            None => None,
        };
        execute_runtime_init_script(
            self.backend.as_ref(),
            &self.settings,
            &adapter,
            &self.runtimes.script_path(&adapter),
            &spec.session_name,
            &spec.project_path,
            &spec.runtime_flags,
            prompt_file.as_deref(),
        )
        .await?;
        self.registry
            .set_status(&spec.session_name, SessionStatus::Started)
            .await?;

        let ready = wait_for_runtime_ready(
            self.backend.as_ref(),
            &adapter,
            &spec.session_name,
            adapter.ready_timeout,
            READINESS_POLL_INTERVAL,
        )
        .await;
        if !ready {
            warn!("session '{}' did not reach readiness", spec.session_name);
            return Ok(false);
        }

        self.registry
            .set_status(&spec.session_name, SessionStatus::Active)
            .await?;
        post_initialize(self.backend.as_ref(), &adapter, &spec.session_name).await?;
        self.activity.record_activity(&spec.session_name);
        self.exit_monitor.start_watch(
            &spec.session_name,
            &spec.agent_id,
            adapter.exit_patterns(),
        )?;
        self.context_monitor
            .start_session_monitoring(
                &spec.session_name,
                &spec.agent_id,
                &spec.team_id,
                &spec.role,
            )
            .await?;
        if !self.assigner.has_project(&spec.project_path) {
            self.assigner.register_project(spec.project_path.clone()).await;
        }
        self.assigner.register_agent(
            &spec.session_name,
            AgentProfile {
                agent_id: spec.agent_id.clone(),
                role: spec.role.clone(),
                project_path: spec.project_path.clone(),
                preferred_task_types: spec.preferred_task_types.clone(),
            },
        );
        self.events.publish(
            Event::new(EventKind::AgentIdle)
                .with_session(&spec.session_name)
                .with_agent(&spec.agent_id),
        );
        info!("session '{}' is active", spec.session_name);
        Ok(true)
    }

    /// Materialize the session's system-prompt file: the template's
    /// placeholders are substituted and the result written next to the
    /// session metadata.
    fn render_prompt_file(&self, spec: &NewSessionSpec, template: &Path) -> Result<PathBuf> {
        let raw = std::fs::read_to_string(template)
            .with_context(|| format!("Failed to read prompt template '{}'", template.display()))?;
        let rendered = crate::prompt::render(
            &raw,
            &crate::prompt::PromptContext {
                role: Some(spec.role.clone()),
                session_id: Some(spec.session_name.clone()),
                member_id: Some(spec.agent_id.clone()),
                project_path: Some(spec.project_path.to_string_lossy().to_string()),
            },
        );
        let dir = self.home.join("prompts");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create prompt dir '{}'", dir.display()))?;
        let path = dir.join(format!("{}.md", spec.session_name));
        std::fs::write(&path, rendered)
            .with_context(|| format!("Failed to write rendered prompt '{}'", path.display()))?;
        Ok(path)
    }

    /// Tear a session down: monitors first, then the backend session.
    pub async fn terminate_session(&self, name: &str) -> Result<()> {
        self.context_monitor.stop_session_monitoring(name);
        self.exit_monitor.stop_watch(name);
        self.assigner.deregister_agent(name);
        self.activity.clear(name);
        self.detector.clear_detection_cache(name);
        match self.backend.kill_session(name).await {
            Ok(()) => {}
            Err(crate::backend::BackendError::SessionNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.registry.remove(name).await;
        info!("session '{}' terminated", name);
        Ok(())
    }

    /// Graceful shutdown: stop loops, flush the meter, end subscribers,
    /// then terminate managed sessions with a grace period.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }
        self.context_monitor.stop();
        self.exit_monitor.stop_all();
        self.assigner.stop_completion_loop().await;
        self.budget.flush().await;
        self.fleet.shutdown().await;

        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);
        for session in self.registry.list().await {
            let name = session.session_name;
            let _ = self.backend.send_key(&name, TerminalKey::CtrlC).await;
            tokio::time::sleep(grace).await;
            if let Err(e) = self.backend.kill_session(&name).await {
                warn!("kill of '{}' failed: {}", name, e);
            }
        }
        self.registry.persist().await;
        info!("agentmux kernel stopped");
    }

    pub async fn get_fleet_snapshot(&self) -> Result<FleetSnapshot> {
        self.snapshotter.fleet_snapshot().await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn budget(&self) -> &Arc<BudgetMeter> {
        &self.budget
    }

    pub fn assigner(&self) -> &Arc<AutoAssigner> {
        &self.assigner
    }

    pub fn fleet(&self) -> &Arc<FleetPublisher> {
        &self.fleet
    }

    pub fn detector(&self) -> &Arc<RuntimeDetector> {
        &self.detector
    }

    /// Periodic sweep flipping silent sessions to idle and nudging the
    /// assigner for every idle one.
    async fn spawn_idle_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock().await;
        if slot.is_some() {
            return;
        }
        let kernel = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                kernel.settings.idle.sweep_interval_ms,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let idle_after = Duration::from_millis(kernel.settings.idle.idle_after_ms);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                for session in kernel.registry.list().await {
                    if session.status != SessionStatus::Active {
                        continue;
                    }
                    let name = &session.session_name;
                    if session.working_status == WorkingStatus::InProgress
                        && kernel.activity.is_idle_for(name, idle_after)
                    {
                        if kernel
                            .registry
                            .set_working_status(name, WorkingStatus::Idle)
                            .await
                            .is_ok()
                        {
                            kernel.events.publish(
                                Event::new(EventKind::AgentIdle)
                                    .with_session(name)
                                    .with_agent(&session.agent_id),
                            );
                        }
                    }
                    let session = kernel.registry.get(name).await;
                    if matches!(
                        session.map(|s| s.working_status),
                        Some(WorkingStatus::Idle)
                    ) {
                        kernel.assigner.assign_next_task(name).await;
                    }
                }
            }
        }));
    }
}
