//! Error types for the Hephaestus core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Storage-level errors shared by the ledger, the message store and config.
#[derive(Debug, Error)]
pub enum Error {
    /// The task is not in `pending`; another assigner won the race.
    #[error("Task {task_id} is already assigned")]
    AlreadyAssigned { task_id: String },

    /// The task is not in progress, or is held by another agent.
    #[error("Task {task_id} is not in progress for this agent")]
    NotInProgress { task_id: String },

    /// No record with this id exists in any state directory.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A destination directory or file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored document failed to parse or its checksum did not validate.
    #[error("CorruptMessage at {}: {reason}", path.display())]
    CorruptMessage { path: PathBuf, reason: String },

    /// The work directory has not been set up with `init`.
    #[error("Work directory not initialized: {}", .0.display())]
    NotInitialized(PathBuf),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error only signals that another actor already performed
    /// the transition. Callers treat these as a no-op rather than a failure.
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::AlreadyAssigned { .. } | Self::NotInProgress { .. })
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteError {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptMessage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
