//! Readiness polling shared by every adapter.

use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::SessionBackend;
use crate::utils::{last_lines, strip_ansi};

use super::RuntimeAdapter;

/// How many rendered lines each poll inspects.
pub const READINESS_CAPTURE_LINES: usize = 30;

/// Poll the session's pane until the adapter's readiness vocabulary shows
/// up, an error pattern shows up, or the timeout lapses.
///
/// Readiness wins when both vocabularies match the same capture. A capture
/// error is logged and retried on the next cycle, never fatal.
pub async fn wait_for_runtime_ready(
    backend: &dyn SessionBackend,
    adapter: &RuntimeAdapter,
    session_name: &str,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        match backend.capture_pane(session_name, READINESS_CAPTURE_LINES).await {
            Ok(raw) => {
                let text = last_lines(&strip_ansi(&raw), READINESS_CAPTURE_LINES);
                if let Some(pattern) = adapter
                    .readiness_patterns
                    .iter()
                    .find(|p| text.contains(p.as_str()))
                {
                    debug!(
                        "session '{}' ready ({} matched '{}')",
                        session_name, adapter.kind, pattern
                    );
                    return true;
                }
                if let Some(pattern) = adapter
                    .error_patterns
                    .iter()
                    .find(|p| text.contains(p.as_str()))
                {
                    warn!(
                        "session '{}' startup failed ({} matched '{}')",
                        session_name, adapter.kind, pattern
                    );
                    return false;
                }
            }
            Err(e) => {
                debug!(
                    "capture failed while waiting for '{}' readiness: {}",
                    session_name, e
                );
            }
        }
        if start.elapsed() + interval > timeout {
            warn!(
                "session '{}' not ready after {:?} ({})",
                session_name, timeout, adapter.kind
            );
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
