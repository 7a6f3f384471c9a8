//! The [`CacheStore`] trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Async key/value abstraction over the cluster-shared ephemeral store.
///
/// Implementations back three concerns: cached session projections (scalar
/// get/set/delete plus the bulk read), per-session mutation locks (the two
/// atomic lock primitives), and liveness/interrupt markers (presence checks
/// via `get`).
///
/// Every method reports infrastructure failure as
/// [`CacheError::Unavailable`](crate::CacheError::Unavailable); a missing
/// key is `Ok(None)`, never an error.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a single value. `Ok(None)` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a single value with a time-to-live.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a single key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Read many values in one underlying round trip.
    ///
    /// The result has the same length and order as `keys`; a missing or
    /// undecodable entry maps to `None` rather than failing the whole call.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// List keys matching a glob-style pattern, up to `max_keys`.
    ///
    /// Cursor-paginated underneath and intended only for small key
    /// populations; listing at scale belongs to an indexed repository
    /// query, not to this method.
    async fn scan_keys(&self, pattern: &str, max_keys: usize) -> Result<Vec<String>>;

    /// Atomically set `key` to a freshly generated ownership token if it is
    /// absent. Returns the token on success, `None` if the key is held.
    ///
    /// The TTL bounds how long a crashed holder can keep the key occupied.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>>;

    /// Atomically delete `key` only if its current value equals `token`.
    ///
    /// Returns whether this call deleted the key. The compare step prevents
    /// releasing a lock some other holder re-acquired after TTL expiry.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;
}
