//! Auto-assign configuration (`<projectPath>/.agentmux/auto-assign.yaml`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PROJECT_DIR_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Prioritization {
    #[default]
    Priority,
    Fifo,
    Deadline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleRule {
    pub role: String,
    pub task_types: Vec<String>,
    pub exclusive: bool,
}

impl Default for RoleRule {
    fn default() -> Self {
        Self {
            role: String::new(),
            task_types: Vec::new(),
            exclusive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancing {
    pub max_concurrent_tasks: u32,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DependencyPolicy {
    pub respect_blocking: bool,
}

impl Default for DependencyPolicy {
    fn default() -> Self {
        Self {
            respect_blocking: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Strategy {
    pub prioritization: Prioritization,
    pub role_matching: Vec<RoleRule>,
    pub load_balancing: LoadBalancing,
    pub dependencies: DependencyPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    pub max_assignments_per_day: u32,
    /// Seconds between assignments to the same agent.
    pub cooldown_between_tasks: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_assignments_per_day: 20,
            cooldown_between_tasks: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoAssignConfig {
    pub enabled: bool,
    pub strategy: Strategy,
    pub limits: Limits,
}

impl Default for AutoAssignConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::default(),
            limits: Limits::default(),
        }
    }
}

impl AutoAssignConfig {
    /// Load a project's config, defaulting on a missing or malformed file.
    pub fn load(project_path: &Path) -> Self {
        let path = project_path.join(PROJECT_DIR_NAME).join("auto-assign.yaml");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_yaml::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// The rule declared for a role, if any.
    pub fn rule_for(&self, role: &str) -> Option<&RoleRule> {
        self.strategy.role_matching.iter().find(|r| r.role == role)
    }

    /// Whether another role claims the task type exclusively.
    pub fn exclusively_claimed_by_other(&self, role: &str, task_type: &str) -> bool {
        self.strategy.role_matching.iter().any(|r| {
            r.role != role && r.exclusive && r.task_types.iter().any(|t| t == task_type)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AutoAssignConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.strategy.prioritization, Prioritization::Priority);
        assert!(cfg.strategy.dependencies.respect_blocking);
        assert_eq!(cfg.limits.max_assignments_per_day, 20);
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let agentmux = dir.path().join(PROJECT_DIR_NAME);
        std::fs::create_dir_all(&agentmux).unwrap();
        std::fs::write(
            agentmux.join("auto-assign.yaml"),
            r#"
enabled: true
strategy:
  prioritization: fifo
  roleMatching:
    - role: qa
      taskTypes: [testing]
      exclusive: true
  loadBalancing:
    maxConcurrentTasks: 2
limits:
  maxAssignmentsPerDay: 5
  cooldownBetweenTasks: 10
"#,
        )
        .unwrap();
        let cfg = AutoAssignConfig::load(dir.path());
        assert_eq!(cfg.strategy.prioritization, Prioritization::Fifo);
        assert_eq!(cfg.strategy.load_balancing.max_concurrent_tasks, 2);
        assert_eq!(cfg.limits.max_assignments_per_day, 5);
        assert!(cfg.exclusively_claimed_by_other("developer", "testing"));
        assert!(!cfg.exclusively_claimed_by_other("qa", "testing"));
    }

    #[test]
    fn test_malformed_yaml_defaults_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let agentmux = dir.path().join(PROJECT_DIR_NAME);
        std::fs::create_dir_all(&agentmux).unwrap();
        std::fs::write(agentmux.join("auto-assign.yaml"), "enabled: [oops").unwrap();
        let cfg = AutoAssignConfig::load(dir.path());
        assert!(cfg.enabled);
    }
}
