//! The session service façade.
//!
//! Composes the repository, the shared store, the distributed lock, and
//! the liveness tracker into the session lifecycle every API process
//! shares:
//!
//! - reads are cache-aside: projection first, repository on miss, then
//!   repopulate
//! - writes are lock-guarded and invalidate (never overwrite) the
//!   projection, so the next reader repopulates from the current row
//! - the repository write is the only one that must succeed; every
//!   shared-store failure degrades and is logged at warning level
//!
//! # Security
//!
//! Ownership checks use constant-time hash comparison and collapse
//! "missing" and "not yours" into one error, so neither timing nor error
//! kind can be used to enumerate valid session ids.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use relay_store::CacheStore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::keys;
use crate::lock::DistributedLock;
use crate::model::{Session, SessionUpdate};
use crate::repository::SessionRepository;
use crate::tracker::ActiveSessionTracker;

/// Hash an API key into the stored owner identifier.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Compare two strings in constant time.
///
/// The comparison cost does not depend on where the first differing byte
/// occurs. When lengths differ a dummy self-comparison keeps the timing
/// consistent before returning false.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() == b_bytes.len() {
        a_bytes.ct_eq(b_bytes).into()
    } else {
        let _ = a_bytes.ct_eq(a_bytes);
        false
    }
}

/// Orchestrates the distributed session lifecycle.
///
/// Holds no authoritative in-memory state: every process constructs one of
/// these over the same repository and shared store and observes the same
/// sessions, locks, and markers.
pub struct SessionService {
    repository: Arc<dyn SessionRepository>,
    cache: Arc<dyn CacheStore>,
    lock: DistributedLock,
    tracker: ActiveSessionTracker,
    config: SessionConfig,
}

impl SessionService {
    /// Build a service over injected backends.
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        cache: Arc<dyn CacheStore>,
        config: SessionConfig,
    ) -> Self {
        let lock = DistributedLock::new(Arc::clone(&cache), &config);
        let tracker = ActiveSessionTracker::new(Arc::clone(&cache), &config);
        Self {
            repository,
            cache,
            lock,
            tracker,
            config,
        }
    }

    /// The liveness/interrupt tracker, for the streaming executor's
    /// mid-stream polling.
    pub fn tracker(&self) -> &ActiveSessionTracker {
        &self.tracker
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Create a session: durable write first, projection best-effort.
    ///
    /// A supplied `parent_session_id` must reference an existing session
    /// (forks always point at a pre-existing id); an unknown parent is
    /// reported as not-found.
    pub async fn create_session(
        &self,
        model: &str,
        parent_session_id: Option<&str>,
        owner_api_key: Option<&str>,
    ) -> Result<Session> {
        if let Some(parent) = parent_session_id
            && self.repository.get(parent).await?.is_none()
        {
            return Err(SessionError::NotFound);
        }

        let session = Session::new(
            model,
            parent_session_id.map(str::to_string),
            owner_api_key.map(hash_api_key),
        );
        let session = self.repository.create(session).await?;
        self.cache_projection(&session).await;

        info!(session_id = %session.id, model = %session.model, "session created");
        Ok(session)
    }

    /// Fetch a session, cache-aside.
    ///
    /// A shared-store failure on either leg degrades to a straight
    /// repository read; it never becomes an error.
    pub async fn get_session(&self, id: &str) -> Result<Session> {
        let key = keys::projection(id);
        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => {
                    trace!(session_id = %id, "projection cache hit");
                    return Ok(session);
                }
                Err(err) => {
                    warn!(session_id = %id, error = %err, "corrupt projection, reading repository");
                }
            },
            Ok(None) => trace!(session_id = %id, "projection cache miss"),
            Err(err) => {
                warn!(session_id = %id, error = %err, "cache read failed, reading repository");
            }
        }

        let session = self
            .repository
            .get(id)
            .await?
            .ok_or(SessionError::NotFound)?;
        self.cache_projection(&session).await;
        Ok(session)
    }

    /// Apply a partial update under the cluster-wide mutation lock.
    ///
    /// Inside the lock: atomic repository update, then projection
    /// **delete**. Invalidating instead of writing through means a slower
    /// concurrent updater can never clobber the cache with a stale copy;
    /// the next reader repopulates from the current row.
    pub async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<Session> {
        let session = self
            .lock
            .with_lock(id, || async move {
                let Some(session) = self.repository.update(id, update).await? else {
                    return Err(SessionError::NotFound);
                };
                if let Err(err) = self.cache.delete(&keys::projection(id)).await {
                    warn!(session_id = %id, error = %err, "projection invalidation failed, TTL will expire it");
                }
                Ok(session)
            })
            .await??;

        debug!(session_id = %id, status = %session.status, "session updated");
        Ok(session)
    }

    /// List sessions, newest first. `page` is 1-based.
    ///
    /// Tenant-scoped listing always resolves to the indexed repository
    /// query on the owner hash. The cache-scan path is a bounded
    /// optimization for small unfiltered populations only, and any
    /// overflow or failure falls back to the repository.
    pub async fn list_sessions(
        &self,
        owner_api_key: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Session>, u64)> {
        let page = page.max(1);
        let offset = u64::from(page - 1) * u64::from(page_size);

        if owner_api_key.is_none()
            && let Some(listing) = self.list_from_cache(page_size, offset).await
        {
            return Ok(listing);
        }

        let owner_hash = owner_api_key.map(hash_api_key);
        let listing = self
            .repository
            .list(owner_hash.as_deref(), page_size, offset)
            .await?;
        Ok(listing)
    }

    /// Verify the caller may access this session.
    ///
    /// Public sessions (no recorded owner) pass through. Otherwise the
    /// caller's key is hashed and compared in constant time; an absent key
    /// is compared as the empty string rather than short-circuiting, so
    /// "wrong key" and "no key" take the same path. The only failure this
    /// ever returns is [`SessionError::NotFound`].
    pub fn enforce_owner(
        &self,
        session: Session,
        current_api_key: Option<&str>,
    ) -> Result<Session> {
        let Some(owner_hash) = session.owner_api_key_hash.clone() else {
            return Ok(session);
        };
        let supplied_hash = hash_api_key(current_api_key.unwrap_or(""));
        if constant_time_eq(&supplied_hash, &owner_hash) {
            Ok(session)
        } else {
            Err(SessionError::NotFound)
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────

    /// Mark this session as streaming somewhere in the cluster.
    pub async fn register_active(&self, id: &str) {
        self.tracker.register(id).await;
    }

    /// Whether some instance is streaming this session.
    pub async fn is_active(&self, id: &str) -> bool {
        self.tracker.is_active(id).await
    }

    /// Drop the liveness marker.
    pub async fn unregister_active(&self, id: &str) {
        self.tracker.unregister(id).await;
    }

    /// Request cooperative cancellation, visible cluster-wide.
    pub async fn mark_interrupted(&self, id: &str) {
        self.tracker.mark_interrupted(id).await;
    }

    /// Whether cancellation has been requested.
    pub async fn is_interrupted(&self, id: &str) -> bool {
        self.tracker.is_interrupted(id).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Best-effort projection write; failure is logged, never propagated.
    async fn cache_projection(&self, session: &Session) {
        let key = keys::projection(&session.id);
        let bytes = match serde_json::to_vec(session) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "projection serialization failed");
                return;
            }
        };
        if let Err(err) = self.cache.set(&key, &bytes, self.config.projection_ttl).await {
            warn!(session_id = %session.id, error = %err, "projection cache write failed");
        }
    }

    /// Bounded cache-only listing. Returns `None` (use the repository)
    /// when disabled, when the key population exceeds the bound, when the
    /// projection set does not cover every live session, or on any
    /// shared-store failure.
    async fn list_from_cache(&self, limit: u32, offset: u64) -> Option<(Vec<Session>, u64)> {
        let bound = self.config.cache_list_limit;
        if bound == 0 {
            return None;
        }

        // Ask for one key past the bound so overflow is detectable.
        let scanned = self
            .cache
            .scan_keys(keys::PROJECTION_PATTERN, bound + 1)
            .await;
        let scanned = match scanned {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "projection scan failed, using repository listing");
                return None;
            }
        };
        if scanned.len() > bound {
            debug!(bound = bound, "projection population over bound, using repository listing");
            return None;
        }

        let values = match self.cache.get_many(&scanned).await {
            Ok(values) => values,
            Err(err) => {
                warn!(error = %err, "projection bulk read failed, using repository listing");
                return None;
            }
        };

        let mut sessions: Vec<Session> = values
            .into_iter()
            .flatten()
            .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        // The projection set is a cache: an entry invalidated by an update
        // or expired by TTL is simply absent. Serve the listing only when
        // it provably covers every live session, checked against the
        // repository count (a COUNT(*) with no rows fetched). Projections
        // are only ever written from repository rows and sessions are
        // never deleted, so equal counts mean equal sets.
        let repo_total = match self.repository.list(None, 0, 0).await {
            Ok((_, total)) => total,
            Err(err) => {
                debug!(error = %err, "repository count failed, using repository listing");
                return None;
            }
        };
        if sessions.len() as u64 != repo_total {
            debug!(
                cached = sessions.len(),
                total = repo_total,
                "projection set incomplete, using repository listing"
            );
            return None;
        }

        let total = sessions.len() as u64;
        let items = sessions
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Some((items, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_api_key_is_deterministic_and_opaque() {
        let a = hash_api_key("sk-test-1");
        let b = hash_api_key("sk-test-1");
        let c = hash_api_key("sk-test-2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.contains("sk-test-1"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }
}
