//! Error types for session coordination.

use std::time::Duration;

use crate::lock::LockError;
use crate::repository::RepositoryError;

/// Error type surfaced by the session service.
///
/// Shared-store failures never appear here: they are logged and degraded
/// to the repository path, because everything in the shared store is
/// reconstructable from the repository.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session does not exist, or the caller does not own it.
    ///
    /// Deliberately one variant for both cases so neither error kind nor
    /// message can be used to enumerate valid session ids.
    #[error("session not found")]
    NotFound,

    /// Exclusive access to the session could not be acquired in time.
    ///
    /// Signals contention, not absence; safe for the caller to retry.
    #[error("could not acquire session lock within {0:?}")]
    LockTimeout(Duration),

    /// The durable store failed. Always propagated, never masked.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<LockError> for SessionError {
    fn from(err: LockError) -> Self {
        let LockError::Timeout(budget) = err;
        SessionError::LockTimeout(budget)
    }
}

/// Result type for session coordination.
pub type Result<T> = std::result::Result<T, SessionError>;
