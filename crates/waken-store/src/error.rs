//! Error types for the state store.

use std::path::PathBuf;

use thiserror::Error;

use crate::CheckpointId;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Could not acquire an exclusive lock.
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint does not exist.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(CheckpointId),

    /// Checkpoint was never committed (snapshot interrupted).
    #[error("checkpoint {0} is incomplete")]
    CheckpointIncomplete(CheckpointId),

    /// Checkpoint contents do not match its manifest.
    #[error("checkpoint {id} failed validation: {reason}")]
    Validation { id: CheckpointId, reason: String },

    /// Malformed checkpoint id.
    #[error("invalid checkpoint id: {0}")]
    InvalidId(String),

    /// Worker id that cannot be used as a record file name.
    #[error("invalid worker id: {0:?}")]
    InvalidWorkerId(String),

    /// The state root is in a shape we cannot work with.
    #[error("invalid state layout: {0}")]
    Layout(String),
}

impl StoreError {
    /// Whether this error means the checkpoint cannot be restored.
    ///
    /// These are the errors a restore retry may resolve (or that eventually
    /// escalate to a failed schedule); everything else is plain I/O.
    pub fn is_restore_error(&self) -> bool {
        matches!(
            self,
            StoreError::CheckpointNotFound(_)
                | StoreError::CheckpointIncomplete(_)
                | StoreError::Validation { .. }
        )
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.into(),
            source,
        }
    }
}
