//! Coordination errors
//!
//! `LockConflict`, `LockContended` and `LockNotOwned` are expected outcomes a
//! caller can recover from; `StoreUnavailable` on a write path is a hard failure.

use recordstore::StoreError;
use thiserror::Error;

use crate::domain::LockConflict;

/// Errors from coordination operations
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Lock conflict: {0}")]
    LockConflict(LockConflict),

    #[error("Lock on {resource_key} kept changing; gave up after {attempts} claim attempts")]
    LockContended { resource_key: String, attempts: usize },

    #[error("Lock on {resource_key} is not held by {holder}")]
    LockNotOwned { resource_key: String, holder: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("{lost} queued message(s) were not flushed: {reason}")]
    MessageDeliveryBestEffort { lost: usize, reason: String },

    #[error("Coordinator has no active session")]
    NotStarted,

    #[error("Store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),

    #[error("Native change watching unavailable: {0}")]
    WatcherUnavailable(#[from] notify::Error),
}

impl CoordError {
    /// The conflict details if this is a lock conflict
    pub fn as_conflict(&self) -> Option<&LockConflict> {
        match self {
            Self::LockConflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Result alias for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;
