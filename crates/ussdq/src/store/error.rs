//! Store error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::OperationStatus;

/// Errors from the operation store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The connection lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// No operation with this id exists.
    #[error("Operation {0} not found")]
    NotFound(String),

    /// The row is no longer in a state the transition applies to.
    #[error("Operation {id} is {current}, cannot move to {target}")]
    StaleTransition {
        id: String,
        current: OperationStatus,
        target: OperationStatus,
    },

    /// A stored row could not be decoded.
    #[error("Invalid row for operation {id}: {reason}")]
    InvalidRow { id: String, reason: String },

    /// Injected or transport-level failure from a non-SQLite store.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Why a change subscription stopped yielding events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The receiver fell behind and missed this many notifications.
    #[error("Missed {0} change notifications")]
    Lagged(u64),

    /// The notification channel is gone.
    #[error("Change notification channel closed")]
    Closed,
}
