//! Error types for QueryDeck Core

use thiserror::Error;

use crate::scheduler::TaskId;

/// Result type alias using QueryDeck Error
pub type Result<T> = std::result::Result<T, Error>;

/// Out-of-sequence transaction operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// `begin` while a transaction is already active
    #[error("transaction already active")]
    AlreadyActive,
    /// `commit`/`rollback` without an active transaction
    #[error("no active transaction")]
    NoActiveTransaction,
}

/// Core error types for the execution engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite backend errors
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Native execute failed or the session dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation attempted on a disconnected session
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// No connection registered under the given id
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Unknown task id passed to poll/remove
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// BEGIN/COMMIT/ROLLBACK called out of sequence
    #[error("Invalid transaction transition: {0}")]
    InvalidTransactionTransition(TransitionError),

    /// Filter kind string not recognized
    #[error("Unsupported filter kind: {0}")]
    UnsupportedFilterKind(String),

    /// Soft cache overrun, reported through logs only
    #[error("Cache capacity exceeded: entry needs {required} bytes, capacity is {capacity}")]
    CacheCapacityExceeded {
        /// Size of the entry being inserted
        required: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// Malformed request rejected before submission
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A row whose width differs from the column count
    #[error("Invalid result shape: row {row} has {actual} values, expected {expected}")]
    InvalidResultShape {
        /// Offending row index
        row: usize,
        /// Column count
        expected: usize,
        /// Value count found in the row
        actual: usize,
    },

    /// Configuration parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a connection-lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Create a not-connected error
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    /// Create an invalid-request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Shorthand for `InvalidTransactionTransition(AlreadyActive)`
    pub fn already_active() -> Self {
        Self::InvalidTransactionTransition(TransitionError::AlreadyActive)
    }

    /// Shorthand for `InvalidTransactionTransition(NoActiveTransaction)`
    pub fn no_active_transaction() -> Self {
        Self::InvalidTransactionTransition(TransitionError::NoActiveTransaction)
    }

    /// True for both transaction sequencing errors
    pub fn is_transition_error(&self) -> bool {
        matches!(self, Self::InvalidTransactionTransition(_))
    }
}
