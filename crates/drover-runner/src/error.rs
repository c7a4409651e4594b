use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for task execution
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors raised while hosting a task
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The request cannot ever run as written
    #[error("unrunnable task spec: {0}")]
    BadSpec(String),

    /// Workspace or artifact filesystem trouble
    #[error("workspace i/o failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An artifact could not be moved between storage and the workspace
    #[error("artifact {name:?} transfer failed: {reason}")]
    Artifact { name: String, reason: String },

    /// The subprocess could not be started or supervised
    #[error("task process failed: {0}")]
    Process(String),
}

impl RunnerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.into(),
            source,
        }
    }
}
