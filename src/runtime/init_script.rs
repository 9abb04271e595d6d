//! Init-script composition and execution.
//!
//! A runtime's launch sequence comes from one of two places: a verbatim
//! per-kind command in settings, or the adapter's init script (one command
//! per non-blank, non-comment line). Runtime flags and the optional system
//! prompt file are injected at the first occurrence of the adapter's
//! permission marker; a sequence without the marker is sent untouched.
//!
//! Initialization is the only adapter surface that propagates errors to the
//! caller.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backend::{SessionBackend, TerminalKey};
use crate::config::Settings;

use super::RuntimeAdapter;

/// Dwell between commands so the hosted CLI's paste detection stays quiet.
pub const INTER_COMMAND_DWELL: Duration = Duration::from_millis(500);

/// Parse an init script into its command lines.
pub fn parse_script(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Inject `flags` before the first occurrence of `marker` across the command
/// sequence, and append the quoted prompt-file flag after it. Identical
/// inputs always produce identical output.
pub fn compose_commands(
    commands: Vec<String>,
    marker: &str,
    flags: &[String],
    prompt_file: Option<&Path>,
) -> Vec<String> {
    let mut composed = Vec::with_capacity(commands.len());
    let mut injected = false;
    for command in commands {
        if injected || !command.contains(marker) {
            composed.push(command);
            continue;
        }
        injected = true;
        let at = command.find(marker).expect("marker position");
        let (before, rest) = command.split_at(at);
        let (marker_text, after) = rest.split_at(marker.len());

        let mut rebuilt = String::with_capacity(command.len() + 64);
        rebuilt.push_str(before);
        for flag in flags {
            rebuilt.push_str(flag);
            rebuilt.push(' ');
        }
        rebuilt.push_str(marker_text);
        if let Some(path) = prompt_file {
            rebuilt.push_str(&format!(
                " --append-system-prompt-file \"{}\"",
                path.display()
            ));
        }
        rebuilt.push_str(after);
        composed.push(rebuilt);
    }
    composed
}

/// Resolve the command sequence for an adapter: settings override first,
/// then the init script on disk.
pub fn resolve_commands(
    settings: &Settings,
    adapter: &RuntimeAdapter,
    script_path: &Path,
) -> Result<Vec<String>> {
    if let Some(command) = settings.runtime_command(adapter.kind.as_str()) {
        return Ok(vec![command.to_string()]);
    }
    let contents = std::fs::read_to_string(script_path).with_context(|| {
        format!(
            "Failed to read init script for {} at '{}'",
            adapter.kind,
            script_path.display()
        )
    })?;
    Ok(parse_script(&contents))
}

/// Run the composed launch sequence inside the session: clear the command
/// line once, `cd` to the target path, then send each command with the
/// fixed dwell.
pub async fn execute_runtime_init_script(
    backend: &dyn SessionBackend,
    settings: &Settings,
    adapter: &RuntimeAdapter,
    script_path: &Path,
    session_name: &str,
    target_path: &Path,
    runtime_flags: &[String],
    prompt_file: Option<&Path>,
) -> Result<()> {
    let commands = resolve_commands(settings, adapter, script_path)?;
    let commands = compose_commands(
        commands,
        &adapter.permission_marker,
        runtime_flags,
        prompt_file,
    );
    if commands.is_empty() {
        warn!(
            "no init commands resolved for {} in '{}'",
            adapter.kind, session_name
        );
        return Ok(());
    }

    backend
        .clear_command_line(session_name)
        .await
        .with_context(|| format!("Failed to clear command line in '{}'", session_name))?;
    send_command(
        backend,
        session_name,
        &format!("cd \"{}\"", target_path.display()),
    )
    .await?;
    tokio::time::sleep(INTER_COMMAND_DWELL).await;

    let total = commands.len();
    for (index, command) in commands.iter().enumerate() {
        send_command(backend, session_name, command).await?;
        if index + 1 < total {
            tokio::time::sleep(INTER_COMMAND_DWELL).await;
        }
    }
    info!(
        "initialized {} in session '{}' ({} command(s))",
        adapter.kind, session_name, total
    );
    Ok(())
}

/// Post-initialization hook, run once the runtime reports ready: stamps the
/// session environment with the runtime kind and announces the adapter's
/// welcome message.
pub async fn post_initialize(
    backend: &dyn SessionBackend,
    adapter: &RuntimeAdapter,
    session_name: &str,
) -> Result<()> {
    backend
        .set_env(session_name, "AGENTMUX_RUNTIME", adapter.kind.as_str())
        .await
        .with_context(|| format!("Failed to stamp runtime kind on '{}'", session_name))?;
    if let Some(welcome) = &adapter.welcome_message {
        info!("{} ({})", welcome, session_name);
    }
    Ok(())
}

async fn send_command(
    backend: &dyn SessionBackend,
    session_name: &str,
    command: &str,
) -> Result<()> {
    backend
        .write(session_name, command)
        .await
        .with_context(|| format!("Failed to write init command to '{}'", session_name))?;
    backend
        .send_key(session_name, TerminalKey::Enter)
        .await
        .with_context(|| format!("Failed to submit init command to '{}'", session_name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MARKER: &str = "--dangerously-skip-permissions";

    #[test]
    fn test_parse_script_skips_comments_and_blanks() {
        let script = "# launch\n\nexport FOO=1\nclaude --dangerously-skip-permissions\n  \n# end\n";
        assert_eq!(
            parse_script(script),
            vec![
                "export FOO=1".to_string(),
                "claude --dangerously-skip-permissions".to_string(),
            ]
        );
    }

    #[test]
    fn test_compose_injects_flags_before_marker_and_prompt_after() {
        let commands = vec!["claude --dangerously-skip-permissions --continue".to_string()];
        let flags = vec!["--model opus".to_string()];
        let prompt = PathBuf::from("/tmp/prompt file.md");
        let composed = compose_commands(commands, MARKER, &flags, Some(&prompt));
        assert_eq!(
            composed,
            vec![
                "claude --model opus --dangerously-skip-permissions \
                 --append-system-prompt-file \"/tmp/prompt file.md\" --continue"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_compose_only_touches_first_marker_occurrence() {
        let commands = vec![
            "echo start".to_string(),
            format!("claude {}", MARKER),
            format!("claude {}", MARKER),
        ];
        let flags = vec!["--verbose".to_string()];
        let composed = compose_commands(commands, MARKER, &flags, None);
        assert_eq!(composed[0], "echo start");
        assert_eq!(composed[1], format!("claude --verbose {}", MARKER));
        assert_eq!(composed[2], format!("claude {}", MARKER));
    }

    #[test]
    fn test_compose_without_marker_is_a_silent_no_op() {
        let commands = vec!["gemini".to_string()];
        let flags = vec!["--flag".to_string()];
        let composed = compose_commands(commands, MARKER, &flags, Some(Path::new("/p.md")));
        assert_eq!(composed, vec!["gemini".to_string()]);
    }

    #[test]
    fn test_compose_is_deterministic() {
        let commands = vec![format!("claude {}", MARKER)];
        let flags = vec!["--a".to_string(), "--b".to_string()];
        let first = compose_commands(commands.clone(), MARKER, &flags, None);
        let second = compose_commands(commands, MARKER, &flags, None);
        assert_eq!(first, second);
    }
}
