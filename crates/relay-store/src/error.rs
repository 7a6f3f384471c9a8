//! Error types for shared-store operations.

/// Error type for shared-store operations.
///
/// A missing key is never an error: reads return `Ok(None)`. This variant
/// exists so callers can tell "the store could not be reached" apart from
/// "the key is not there" and degrade accordingly.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The store could not be reached or the operation failed in transit.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for shared-store operations.
pub type Result<T> = std::result::Result<T, CacheError>;
