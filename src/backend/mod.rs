//! The terminal backend contract.
//!
//! The control plane treats this trait as the single source of truth for
//! terminal I/O. Output subscriptions are ordered per session: chunks arrive
//! on the channel in receipt order, and dropping the receiver is the
//! unsubscribe.

pub mod tmux;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

pub use tmux::TmuxBackend;

/// Error types for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Session '{0}' not found")]
    SessionNotFound(String),
    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Ordered output feed for one session. Chunks arrive in receipt order;
/// dropping the receiver is the unsubscribe.
pub type OutputSubscription = async_channel::Receiver<String>;

/// Named keys and literal text deliverable to a session's terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalKey {
    Enter,
    CtrlC,
    CtrlU,
    Escape,
    Text(String),
}

/// Handle returned by session creation.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedSession {
    pub pid: Option<u32>,
}

/// Spawns, observes, and terminates named PTY sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create a named session rooted at `cwd` with extra environment.
    async fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> BackendResult<SpawnedSession>;

    async fn session_exists(&self, name: &str) -> BackendResult<bool>;

    /// Names of every live session the backend knows about.
    async fn list_sessions(&self) -> BackendResult<Vec<String>>;

    /// Write literal text to the session without a trailing Enter.
    async fn write(&self, name: &str, data: &str) -> BackendResult<()>;

    async fn send_key(&self, name: &str, key: TerminalKey) -> BackendResult<()>;

    /// The last `lines` rendered lines of the session's pane, ANSI intact.
    async fn capture_pane(&self, name: &str, lines: usize) -> BackendResult<String>;

    /// Subscribe to the session's output stream. Chunks are delivered in
    /// receipt order; dropping the receiver unsubscribes.
    fn subscribe_output(&self, name: &str) -> BackendResult<OutputSubscription>;

    async fn kill_session(&self, name: &str) -> BackendResult<()>;

    /// Clear whatever is typed on the session's current command line.
    async fn clear_command_line(&self, name: &str) -> BackendResult<()>;

    async fn set_env(&self, name: &str, key: &str, value: &str) -> BackendResult<()>;
}
