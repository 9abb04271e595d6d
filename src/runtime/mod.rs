//! Runtime adapters: one capability record per supported agent CLI.
//!
//! An adapter is data plus a couple of opt-in switches, not a subclass: the
//! readiness/error/exit vocabularies, the passive detection markers, the
//! init-script name, and the permission-flag marker the init composer
//! anchors on. Template behaviors (readiness polling, memoized detection,
//! init-script composition) live in the sibling modules and work against
//! any adapter.

pub mod claude_code;
pub mod codex;
pub mod detection;
pub mod gemini;
pub mod init_script;
pub mod readiness;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Supported agent CLI kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    ClaudeCode,
    Codex,
    Gemini,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::ClaudeCode => "claude-code",
            RuntimeKind::Codex => "codex",
            RuntimeKind::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude-code" => Some(RuntimeKind::ClaudeCode),
            "codex" => Some(RuntimeKind::Codex),
            "gemini" => Some(RuntimeKind::Gemini),
            _ => None,
        }
    }

    pub fn all() -> [RuntimeKind; 3] {
        [RuntimeKind::ClaudeCode, RuntimeKind::Codex, RuntimeKind::Gemini]
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability record for one runtime kind.
#[derive(Debug, Clone)]
pub struct RuntimeAdapter {
    pub kind: RuntimeKind,
    pub display_name: String,
    /// Case-sensitive substrings indicating the CLI is ready for input.
    pub readiness_patterns: Vec<String>,
    /// Case-sensitive substrings indicating startup failed.
    pub error_patterns: Vec<String>,
    /// Regexes indicating the CLI process has ended.
    pub exit_patterns: Vec<Regex>,
    /// Substrings used by passive detection.
    pub detection_markers: Vec<String>,
    /// Keystroke for active detection probing. `None` keeps detection
    /// strictly passive.
    pub probe_keystroke: Option<String>,
    /// Flag anchor the init composer injects runtime flags around.
    pub permission_marker: String,
    /// Init script file name under `config/runtime_scripts/`.
    pub init_script: String,
    pub welcome_message: Option<String>,
    /// Readiness wait budget when none is supplied by the caller.
    pub ready_timeout: Duration,
}

impl RuntimeAdapter {
    /// Exit patterns, as consumed by the exit monitor.
    pub fn exit_patterns(&self) -> Vec<Regex> {
        self.exit_patterns.clone()
    }

    /// An adapter must not declare a pattern that signals both readiness and
    /// exit.
    pub fn validate(&self) -> Result<()> {
        for ready in &self.readiness_patterns {
            for exit in &self.exit_patterns {
                if exit.is_match(ready) {
                    anyhow::bail!(
                        "adapter '{}' declares '{}' as both readiness and exit indicator",
                        self.kind,
                        ready
                    );
                }
            }
        }
        Ok(())
    }
}

/// One entry of `config/runtime-config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfigEntry {
    pub display_name: Option<String>,
    pub init_script: Option<String>,
    pub welcome_message: Option<String>,
    /// Readiness timeout in milliseconds.
    pub timeout: Option<u64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfigFile {
    #[serde(default)]
    pub runtimes: HashMap<String, RuntimeConfigEntry>,
}

/// Registry mapping runtime kind to adapter, built once at startup.
pub struct RuntimeRegistry {
    adapters: HashMap<RuntimeKind, Arc<RuntimeAdapter>>,
    /// Directory holding init scripts (`config/runtime_scripts`).
    scripts_dir: PathBuf,
}

impl RuntimeRegistry {
    /// Registry with the built-in adapter table.
    pub fn builtin(project_root: &Path) -> Self {
        let mut adapters = HashMap::new();
        for adapter in [claude_code::adapter(), codex::adapter(), gemini::adapter()] {
            adapter.validate().expect("built-in adapter vocabulary");
            adapters.insert(adapter.kind, Arc::new(adapter));
        }
        Self {
            adapters,
            scripts_dir: project_root.join("config").join("runtime_scripts"),
        }
    }

    /// Overlay `config/runtime-config.json` if present. Unknown runtime
    /// kinds and malformed files are warned about and skipped.
    pub fn with_config_file(mut self, project_root: &Path) -> Self {
        let path = project_root.join("config").join("runtime-config.json");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return self;
        };
        let parsed: RuntimeConfigFile = match serde_json::from_str(&raw) {
            Ok(f) => f,
            Err(e) => {
                warn!("ignoring malformed {}: {}", path.display(), e);
                return self;
            }
        };
        for (kind_str, entry) in parsed.runtimes {
            let Some(kind) = RuntimeKind::parse(&kind_str) else {
                warn!("unknown runtime kind '{}' in runtime-config.json", kind_str);
                continue;
            };
            if let Some(existing) = self.adapters.get(&kind) {
                let mut adapter = (**existing).clone();
                if let Some(name) = entry.display_name {
                    adapter.display_name = name;
                }
                if let Some(script) = entry.init_script {
                    adapter.init_script = script;
                }
                if let Some(welcome) = entry.welcome_message {
                    adapter.welcome_message = Some(welcome);
                }
                if let Some(ms) = entry.timeout {
                    adapter.ready_timeout = Duration::from_millis(ms);
                }
                self.adapters.insert(kind, Arc::new(adapter));
            }
        }
        self
    }

    pub fn get(&self, kind: RuntimeKind) -> Option<Arc<RuntimeAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn script_path(&self, adapter: &RuntimeAdapter) -> PathBuf {
        self.scripts_dir.join(&adapter.init_script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_all_kinds() {
        let registry = RuntimeRegistry::builtin(Path::new("."));
        for kind in RuntimeKind::all() {
            assert!(registry.get(kind).is_some(), "missing adapter for {}", kind);
        }
    }

    #[test]
    fn test_adapter_vocabularies_do_not_collide() {
        for adapter in [claude_code::adapter(), codex::adapter(), gemini::adapter()] {
            adapter.validate().unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_colliding_vocabulary() {
        let mut adapter = claude_code::adapter();
        adapter
            .exit_patterns
            .push(Regex::new(regex::escape(&adapter.readiness_patterns[0]).as_str()).unwrap());
        assert!(adapter.validate().is_err());
    }

    #[test]
    fn test_config_overlay_applies_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("runtime-config.json"),
            r#"{"runtimes": {"codex": {"displayName": "OpenAI Codex CLI", "timeout": 45000},
                             "mystery": {"timeout": 1}}}"#,
        )
        .unwrap();
        let registry = RuntimeRegistry::builtin(dir.path()).with_config_file(dir.path());
        let codex = registry.get(RuntimeKind::Codex).unwrap();
        assert_eq!(codex.display_name, "OpenAI Codex CLI");
        assert_eq!(codex.ready_timeout, Duration::from_millis(45_000));
    }

    #[test]
    fn test_runtime_kind_round_trips() {
        for kind in RuntimeKind::all() {
            assert_eq!(RuntimeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RuntimeKind::parse("vim"), None);
    }
}
