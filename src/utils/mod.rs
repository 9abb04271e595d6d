//! Text and error-handling utilities shared across the control plane.

pub mod error;

use std::sync::LazyLock;

use regex::Regex;

pub use error::ErrorContext;

/// CSI/OSC escape sequences emitted by interactive CLIs. The OSC branch
/// tolerates both BEL and ST terminators.
static ANSI_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
        .expect("ANSI escape regex")
});

static WHITESPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Strip ANSI escape sequences from terminal output.
pub fn strip_ansi(raw: &str) -> String {
    ANSI_ESCAPES.replace_all(raw, "").into_owned()
}

/// Collapse whitespace runs into single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUNS.replace_all(text.trim(), " ").into_owned()
}

/// The last `count` lines of a pane capture, joined with newlines.
pub fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_removes_color_and_cursor_codes() {
        let raw = "\x1b[32mgreen\x1b[0m and \x1b[2K\x1b[1Aplain";
        assert_eq!(strip_ansi(raw), "green and plain");
    }

    #[test]
    fn test_strip_ansi_removes_osc_titles() {
        let raw = "\x1b]0;window title\x07visible";
        assert_eq!(strip_ansi(raw), "visible");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \t b\n\nc  "), "a b c");
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(last_lines("a\nb", 10), "a\nb");
    }
}
