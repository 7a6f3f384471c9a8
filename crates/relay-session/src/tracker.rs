//! Cluster-visible liveness and interrupt markers.
//!
//! Replaces the process-local "which sessions are live" registry with
//! presence-only, TTL-bounded records in the shared store, so any instance
//! can register, interrupt, or observe a session that is actually
//! streaming on another instance. The streaming executor polls
//! [`is_interrupted`](ActiveSessionTracker::is_interrupted) between turns.
//!
//! Markers are advisory: losing one (TTL expiry, store outage) never
//! corrupts the durable session record. Writes are therefore best-effort
//! and existence checks degrade to `false` when the store is down.

use std::sync::Arc;
use std::time::Duration;

use relay_store::CacheStore;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::keys;

/// Marker payload. Presence is the signal; the value is irrelevant.
const MARKER: &[u8] = b"1";

/// Tracks in-flight streams and interrupt requests across the cluster.
#[derive(Clone)]
pub struct ActiveSessionTracker {
    store: Arc<dyn CacheStore>,
    active_ttl: Duration,
    interrupt_ttl: Duration,
}

impl ActiveSessionTracker {
    /// Build a tracker over the shared store using the service configuration.
    pub fn new(store: Arc<dyn CacheStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            active_ttl: config.active_ttl,
            interrupt_ttl: config.interrupt_ttl,
        }
    }

    /// Mark a session as having an in-flight stream.
    ///
    /// The TTL is the fail-safe unregister for crashed streamers.
    pub async fn register(&self, session_id: &str) {
        let key = keys::active(session_id);
        if let Err(err) = self.store.set(&key, MARKER, self.active_ttl).await {
            warn!(session_id = %session_id, error = %err, "failed to register active session");
        } else {
            debug!(session_id = %session_id, "session registered as active");
        }
    }

    /// Whether some instance is currently streaming this session.
    pub async fn is_active(&self, session_id: &str) -> bool {
        self.marker_exists(&keys::active(session_id), session_id).await
    }

    /// Remove the liveness marker. Best-effort; TTL covers the rest.
    pub async fn unregister(&self, session_id: &str) {
        let key = keys::active(session_id);
        if let Err(err) = self.store.delete(&key).await {
            warn!(session_id = %session_id, error = %err, "failed to unregister active session");
        }
    }

    /// Request cooperative cancellation of this session's stream.
    ///
    /// Visible to whichever instance is streaming; expires after the
    /// cancellation window so a stale request cannot kill a future stream.
    pub async fn mark_interrupted(&self, session_id: &str) {
        let key = keys::interrupted(session_id);
        if let Err(err) = self.store.set(&key, MARKER, self.interrupt_ttl).await {
            warn!(session_id = %session_id, error = %err, "failed to mark session interrupted");
        } else {
            debug!(session_id = %session_id, "session marked interrupted");
        }
    }

    /// Whether cancellation has been requested. Polled between turns.
    pub async fn is_interrupted(&self, session_id: &str) -> bool {
        self.marker_exists(&keys::interrupted(session_id), session_id)
            .await
    }

    /// Clear an interrupt marker after the stream has unwound.
    pub async fn clear_interrupted(&self, session_id: &str) {
        let key = keys::interrupted(session_id);
        if let Err(err) = self.store.delete(&key).await {
            warn!(session_id = %session_id, error = %err, "failed to clear interrupt marker");
        }
    }

    async fn marker_exists(&self, key: &str, session_id: &str) -> bool {
        match self.store.get(key).await {
            Ok(marker) => marker.is_some(),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "marker check failed, reporting inactive");
                false
            }
        }
    }
}
