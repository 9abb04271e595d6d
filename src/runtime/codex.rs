//! OpenAI Codex CLI adapter.
//!
//! Codex renders no stable banner in some terminal sizes, so the adapter
//! opts into active probing: a `/` keystroke makes the slash-command popup
//! appear, which detection can match on.

use std::time::Duration;

use regex::Regex;

use super::{RuntimeAdapter, RuntimeKind};

pub fn adapter() -> RuntimeAdapter {
    RuntimeAdapter {
        kind: RuntimeKind::Codex,
        display_name: "Codex".to_string(),
        readiness_patterns: vec![
            "OpenAI Codex".to_string(),
            "Ctrl+C to exit".to_string(),
        ],
        error_patterns: vec![
            "command not found: codex".to_string(),
            "Not logged in".to_string(),
            "rate limit".to_string(),
        ],
        exit_patterns: vec![
            Regex::new(r"(?i)codex session (?:ended|closed)").expect("exit pattern"),
            Regex::new(r"\[process exited\b").expect("exit pattern"),
        ],
        detection_markers: vec![
            "OpenAI Codex".to_string(),
            "/model".to_string(),
            "/approvals".to_string(),
        ],
        probe_keystroke: Some("/".to_string()),
        permission_marker: "--dangerously-bypass-approvals-and-sandbox".to_string(),
        init_script: "codex_init.sh".to_string(),
        welcome_message: Some("Codex agent online".to_string()),
        ready_timeout: Duration::from_secs(45),
    }
}
