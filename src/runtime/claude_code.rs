//! Claude Code adapter.

use std::time::Duration;

use regex::Regex;

use super::{RuntimeAdapter, RuntimeKind};

pub fn adapter() -> RuntimeAdapter {
    RuntimeAdapter {
        kind: RuntimeKind::ClaudeCode,
        display_name: "Claude Code".to_string(),
        readiness_patterns: vec![
            "Welcome to Claude".to_string(),
            "? for shortcuts".to_string(),
            "bypass permissions".to_string(),
        ],
        error_patterns: vec![
            "command not found: claude".to_string(),
            "Invalid API key".to_string(),
            "Credit balance is too low".to_string(),
            "ENOENT".to_string(),
        ],
        exit_patterns: vec![
            Regex::new(r"(?i)claude (?:code )?session ended").expect("exit pattern"),
            Regex::new(r"(?m)^\s*Goodbye!\s*$").expect("exit pattern"),
            Regex::new(r"\[process exited\b").expect("exit pattern"),
        ],
        detection_markers: vec![
            "? for shortcuts".to_string(),
            "Welcome to Claude".to_string(),
            "claude-code".to_string(),
        ],
        probe_keystroke: None,
        permission_marker: "--dangerously-skip-permissions".to_string(),
        init_script: "claude_code_init.sh".to_string(),
        welcome_message: Some("Claude Code agent online".to_string()),
        ready_timeout: Duration::from_secs(60),
    }
}
