//! Error types for nudge-core

use thiserror::Error;

/// Result type alias using nudge-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nudge-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error that is not transient contention
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Storage stayed busy for the whole retry budget
    #[error("Database busy after {attempts} attempts")]
    Busy {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// A table check or uniqueness constraint rejected the write
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Reminder, notification, peer or handle not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Recurrence rule that can never produce an occurrence
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    /// Savepoint or explicit transaction misuse
    #[error("Savepoint error: {0}")]
    Savepoint(#[from] SavepointError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request to a peer failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A peer could not be reached or answered with an error envelope
    #[error("Peer error: {0}")]
    Peer(String),

    /// Notification transport failure
    #[error("Notification transport error: {0}")]
    Transport(#[from] crate::scheduler::TransportError),

    /// Background worker failed to run
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Misuse of the explicit transaction and savepoint API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SavepointError {
    /// A savepoint was requested outside an explicit transaction
    #[error("no active transaction")]
    NoTransaction,

    /// A second explicit transaction was requested on the same connection
    #[error("a transaction is already active on this connection")]
    TransactionActive,

    /// The name is not in the active savepoint namespace
    #[error("unknown savepoint: {0}")]
    UnknownSavepoint(String),
}

impl Error {
    /// Whether the caller gave us something we refuse to store.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::Constraint(_) | Self::InvalidRecurrence(_)
        )
    }

    /// Whether the error is a soft "nothing there" condition.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
