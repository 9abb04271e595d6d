//! Gemini CLI adapter.

use std::time::Duration;

use regex::Regex;

use super::{RuntimeAdapter, RuntimeKind};

pub fn adapter() -> RuntimeAdapter {
    RuntimeAdapter {
        kind: RuntimeKind::Gemini,
        display_name: "Gemini CLI".to_string(),
        readiness_patterns: vec![
            "Gemini CLI".to_string(),
            "Type your message".to_string(),
        ],
        error_patterns: vec![
            "command not found: gemini".to_string(),
            "Quota exceeded".to_string(),
            "FatalError".to_string(),
        ],
        exit_patterns: vec![
            Regex::new(r"(?i)agent powering down").expect("exit pattern"),
            Regex::new(r"\[process exited\b").expect("exit pattern"),
        ],
        detection_markers: vec!["Gemini CLI".to_string(), "gemini-2.5".to_string()],
        probe_keystroke: None,
        permission_marker: "--yolo".to_string(),
        init_script: "gemini_init.sh".to_string(),
        welcome_message: Some("Gemini agent online".to_string()),
        ready_timeout: Duration::from_secs(45),
    }
}
