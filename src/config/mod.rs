//! Configuration: home-directory resolution, tunable settings, and the
//! environment variables the control plane consumes.
//!
//! Every config file is loaded read-through: a missing file yields defaults
//! silently, a malformed file yields defaults with a warning. The system
//! never refuses to start over bad configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable overriding the global agentmux home directory.
pub const ENV_AGENTMUX_HOME: &str = "AGENTMUX_HOME";
/// HTTP API port (consumed by the transport collaborator, informative here).
pub const ENV_API_PORT: &str = "API_PORT";
/// MCP port (informative).
pub const ENV_MCP_PORT: &str = "AGENTMUX_MCP_PORT";
/// Project path injected into each agent session's environment.
pub const ENV_PROJECT_PATH: &str = "PROJECT_PATH";
/// Role injected into each agent session's environment.
pub const ENV_AGENT_ROLE: &str = "AGENTMUX_ROLE";
/// Legacy alias for the role variable, still exported for older prompts.
pub const ENV_AGENT_ROLE_ALIAS: &str = "AGENT_ROLE";
/// Session identity injected into each agent session's environment.
pub const ENV_SESSION_NAME: &str = "AGENTMUX_SESSION";

/// Name of the per-project config directory (`<projectPath>/.agentmux/`).
pub const PROJECT_DIR_NAME: &str = ".agentmux";

/// Resolve the global agentmux home: `$AGENTMUX_HOME`, else `~/.agentmux`.
pub fn agentmux_home() -> PathBuf {
    if let Ok(home) = std::env::var(ENV_AGENTMUX_HOME) {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    let user_home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&user_home).join(PROJECT_DIR_NAME)
}

/// Context-window thresholds and monitor cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Percent at which the level becomes yellow.
    pub yellow_threshold: u8,
    /// Percent at which the level becomes red.
    pub red_threshold: u8,
    /// Percent at which the level becomes critical and recovery triggers.
    pub critical_threshold: u8,
    /// Stale-sweep cadence in milliseconds.
    pub check_interval_ms: u64,
    /// Age after which a non-normal detection is considered stale.
    pub stale_detection_threshold_ms: u64,
    /// Cap on the rolling parse buffer, in bytes.
    pub max_buffer_size: usize,
    /// Sliding window for recovery rate limiting.
    pub cooldown_window_ms: u64,
    /// Maximum recoveries allowed inside the cooldown window.
    pub max_recoveries_per_window: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            yellow_threshold: 70,
            red_threshold: 85,
            critical_threshold: 95,
            check_interval_ms: 30_000,
            stale_detection_threshold_ms: 300_000,
            max_buffer_size: 16_384,
            cooldown_window_ms: 600_000,
            max_recoveries_per_window: 3,
        }
    }
}

/// Fleet publisher cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// Idle watchdog cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    pub sweep_interval_ms: u64,
    /// Activity silence after which an active session is flipped to idle.
    pub idle_after_ms: u64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 15_000,
            idle_after_ms: 120_000,
        }
    }
}

/// Top-level settings, loadable from `<home>/settings.yaml` or `.json`.
/// Keys are snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Verbatim launch command per runtime kind. When present and non-blank,
    /// it replaces the runtime's init script entirely.
    pub runtime_commands: HashMap<String, String>,
    pub context: ContextSettings,
    pub fleet: FleetSettings,
    pub idle: IdleSettings,
    /// Grace period between Ctrl-C and kill on shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_commands: HashMap::new(),
            context: ContextSettings::default(),
            fleet: FleetSettings::default(),
            idle: IdleSettings::default(),
            shutdown_grace_ms: 3_000,
        }
    }
}

impl Settings {
    /// Load settings from the given home directory, falling back to defaults
    /// on any missing or malformed file.
    pub fn load(home: &Path) -> Self {
        for name in ["settings.yaml", "settings.json"] {
            let path = home.join(name);
            if !path.exists() {
                continue;
            }
            match config::Config::builder()
                .add_source(config::File::from(path.clone()))
                .build()
                .and_then(|c| c.try_deserialize::<Settings>())
            {
                Ok(s) => return s,
                Err(e) => {
                    warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                }
            }
        }
        Self::default()
    }

    /// The verbatim launch command configured for a runtime kind, if any.
    pub fn runtime_command(&self, kind: &str) -> Option<&str> {
        self.runtime_commands
            .get(kind)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let s = Settings::default();
        assert_eq!(s.context.yellow_threshold, 70);
        assert_eq!(s.context.red_threshold, 85);
        assert_eq!(s.context.critical_threshold, 95);
        assert_eq!(s.context.max_recoveries_per_window, 3);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(dir.path());
        assert_eq!(s.fleet.poll_interval_ms, 5_000);
        assert_eq!(s.shutdown_grace_ms, 3_000);
    }

    #[test]
    fn test_load_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.yaml"), "context: [not, a, map]").unwrap();
        let s = Settings::load(dir.path());
        assert_eq!(s.context.critical_threshold, 95);
    }

    #[test]
    fn test_blank_runtime_command_is_ignored() {
        let mut s = Settings::default();
        s.runtime_commands
            .insert("claude-code".to_string(), "   ".to_string());
        assert!(s.runtime_command("claude-code").is_none());
        s.runtime_commands
            .insert("codex".to_string(), "codex --full-auto".to_string());
        assert_eq!(s.runtime_command("codex"), Some("codex --full-auto"));
    }
}
