//! Error types for the scheduler.

use thiserror::Error;

use waken_store::StoreError;

use crate::ResetSchedule;
use crate::signal::ParseError;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persistence error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The announcement could not be parsed.
    #[error("could not parse reset signal: {0}")]
    Parse(#[from] ParseError),

    /// A restart record already exists.
    #[error(
        "schedule conflict: a {} restart for {} already exists",
        .existing.status,
        .existing.scheduled_at
    )]
    Conflict { existing: Box<ResetSchedule> },

    /// No committed checkpoint to restore from.
    #[error("no complete checkpoint available")]
    NoCheckpoint,

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SchedulerError {
    /// Whether this is a restore failure (retried by the watchdog).
    pub fn is_restore_error(&self) -> bool {
        match self {
            SchedulerError::Store(e) => e.is_restore_error(),
            SchedulerError::NoCheckpoint => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(e: tokio::task::JoinError) -> Self {
        SchedulerError::Task(e.to_string())
    }
}
