//! Configuration for the session coordination layer.

use std::time::Duration;

/// Default TTL for cached session projections.
pub const DEFAULT_PROJECTION_TTL: Duration = Duration::from_secs(60 * 60);

/// Default TTL for a mutation lock: one operation's worth.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default budget for acquiring a mutation lock.
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial lock retry delay.
pub const DEFAULT_LOCK_RETRY_INITIAL: Duration = Duration::from_millis(10);

/// Cap on the doubled lock retry delay.
pub const DEFAULT_LOCK_RETRY_CAP: Duration = Duration::from_millis(500);

/// Default TTL for active-session markers.
pub const DEFAULT_ACTIVE_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// Default TTL for interrupt markers.
pub const DEFAULT_INTERRUPT_TTL: Duration = Duration::from_secs(5 * 60);

/// Configuration for [`SessionService`](crate::SessionService).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TTL for cached session projections.
    pub projection_ttl: Duration,

    /// TTL on the mutation lock key. Must comfortably exceed one
    /// repository update; it is the crash failsafe, not the release path.
    pub lock_ttl: Duration,

    /// How long a mutation waits for the lock before giving up.
    pub lock_acquire_timeout: Duration,

    /// Initial delay between lock retries (doubled up to the cap).
    pub lock_retry_initial: Duration,

    /// Cap on the lock retry delay.
    pub lock_retry_cap: Duration,

    /// TTL for active-session liveness markers.
    pub active_ttl: Duration,

    /// TTL for interrupt markers.
    pub interrupt_ttl: Duration,

    /// Bound on the cache-scan listing fast path. The scan path is only
    /// taken when every projection fits within this bound; 0 disables it
    /// and every listing goes through the indexed repository query.
    pub cache_list_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            projection_ttl: DEFAULT_PROJECTION_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_acquire_timeout: DEFAULT_LOCK_ACQUIRE_TIMEOUT,
            lock_retry_initial: DEFAULT_LOCK_RETRY_INITIAL,
            lock_retry_cap: DEFAULT_LOCK_RETRY_CAP,
            active_ttl: DEFAULT_ACTIVE_TTL,
            interrupt_ttl: DEFAULT_INTERRUPT_TTL,
            cache_list_limit: 0,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the projection TTL.
    pub fn with_projection_ttl(mut self, ttl: Duration) -> Self {
        self.projection_ttl = ttl;
        self
    }

    /// Set the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the lock acquisition budget.
    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    /// Set the initial lock retry delay.
    pub fn with_lock_retry_initial(mut self, delay: Duration) -> Self {
        self.lock_retry_initial = delay;
        self
    }

    /// Set the lock retry delay cap.
    pub fn with_lock_retry_cap(mut self, cap: Duration) -> Self {
        self.lock_retry_cap = cap;
        self
    }

    /// Set the active-session marker TTL.
    pub fn with_active_ttl(mut self, ttl: Duration) -> Self {
        self.active_ttl = ttl;
        self
    }

    /// Set the interrupt marker TTL.
    pub fn with_interrupt_ttl(mut self, ttl: Duration) -> Self {
        self.interrupt_ttl = ttl;
        self
    }

    /// Enable the bounded cache-scan listing fast path.
    pub fn with_cache_list_limit(mut self, limit: usize) -> Self {
        self.cache_list_limit = limit;
        self
    }
}
