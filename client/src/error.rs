//! Unified error handling for the sync runtime.

use crate::db::StoreError;

/// Error returned by public [`SyncEngine`](crate::SyncEngine) calls.
///
/// Network failures during a sync pass never surface here; they become
/// retries, rollbacks and events.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] encore_engine::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Engine is not initialized")]
    NotReady,

    #[error("Engine has been disposed")]
    Disposed,
}

impl EngineError {
    /// Whether the request was rejected before anything was persisted.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(e) if e.is_validation())
    }
}

/// Result type alias for engine calls.
pub type Result<T> = std::result::Result<T, EngineError>;
