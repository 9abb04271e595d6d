//! Error context helpers.

use std::path::Path;

use anyhow::{Context, Result};

/// Attaches a description of the in-flight operation to IO and persistence
/// errors, so failures surface as "error while <doing something>" with the
/// file involved when there is one. Context is built lazily, only on the
/// error path.
pub trait ErrorContext<T> {
    fn during(self, operation: &str) -> Result<T>;

    fn during_path(self, operation: &str, path: &Path) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn during(self, operation: &str) -> Result<T> {
        self.with_context(|| format!("error while {}", operation))
    }

    fn during_path(self, operation: &str, path: &Path) -> Result<T> {
        self.with_context(|| format!("error while {} ({})", operation, path.display()))
    }
}
