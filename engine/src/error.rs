//! Error types for the Encore engine.

use crate::ItemId;
use thiserror::Error;

/// All possible errors from the Encore engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("operation name must not be empty")]
    EmptyOperationName,

    #[error("entity key must not be empty")]
    EmptyEntityKey,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("dependency {0} has already failed")]
    DependencyFailed(ItemId),

    #[error("invalid url pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // State errors
    #[error("queue item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("queue item {0} is being processed and cannot be removed")]
    ItemInFlight(ItemId),

    #[error("optimistic snapshot already exists for item {0}")]
    SnapshotExists(ItemId),

    #[error("no pending conflict for item {0}")]
    NoPendingConflict(ItemId),
}

impl Error {
    /// Whether this error rejects a request before anything is persisted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyOperationName
                | Error::EmptyEntityKey
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::DependencyFailed(_)
                | Error::InvalidPattern { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
