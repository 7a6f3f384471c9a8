//! Distributed per-session mutual exclusion.
//!
//! Built on the shared store's atomic `acquire_lock`/`release_lock`
//! primitives, so exclusion holds across the whole cluster, not just
//! within one process. The TTL on the lock key is the crash failsafe:
//! correctness never depends on release running, only on the TTL being
//! shorter than any plausible crash-to-recovery window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use relay_store::CacheStore;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::SessionConfig;
use crate::keys;

/// Error type for lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was not acquired within the configured budget.
    ///
    /// Signals contention on the session. Distinct from not-found so
    /// callers can surface "busy, retry" instead of a misleading 404.
    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),
}

/// Acquisition state machine. Each `acquire` call walks
/// `Idle → Retrying → {Acquired, TimedOut}`; the two right-hand states
/// are terminal.
enum LockState {
    /// No attempt made yet.
    Idle,
    /// Last attempt found the lock held; waiting `delay` before the next.
    Retrying { delay: Duration },
    /// The store accepted our token.
    Acquired { token: String },
    /// The acquisition budget ran out.
    TimedOut,
}

/// Cluster-wide mutual exclusion for session mutation.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    acquire_timeout: Duration,
    retry_initial: Duration,
    retry_cap: Duration,
}

impl DistributedLock {
    /// Build a lock over the shared store using the service configuration.
    pub fn new(store: Arc<dyn CacheStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            ttl: config.lock_ttl,
            acquire_timeout: config.lock_acquire_timeout,
            retry_initial: config.lock_retry_initial,
            retry_cap: config.lock_retry_cap,
        }
    }

    /// Acquire the mutation lock for `session_id`, retrying with jittered
    /// exponential backoff until the acquisition budget runs out.
    pub async fn acquire(&self, session_id: &str) -> Result<LockGuard, LockError> {
        let key = keys::lock(session_id);
        let deadline = Instant::now() + self.acquire_timeout;
        let mut state = LockState::Idle;

        loop {
            state = match state {
                LockState::Idle => match self.try_acquire(&key).await {
                    Some(token) => LockState::Acquired { token },
                    None => LockState::Retrying {
                        delay: self.retry_initial,
                    },
                },
                LockState::Retrying { delay } => {
                    let wait = jittered(delay);
                    if Instant::now() + wait >= deadline {
                        LockState::TimedOut
                    } else {
                        trace!(key = %key, wait_ms = wait.as_millis() as u64, "lock held, backing off");
                        tokio::time::sleep(wait).await;
                        match self.try_acquire(&key).await {
                            Some(token) => LockState::Acquired { token },
                            None => LockState::Retrying {
                                delay: next_delay(delay, self.retry_cap),
                            },
                        }
                    }
                }
                LockState::Acquired { token } => {
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        key,
                        token,
                        released: false,
                    });
                }
                LockState::TimedOut => return Err(LockError::Timeout(self.acquire_timeout)),
            };
        }
    }

    /// Run `f` while holding the lock for `session_id`, releasing on every
    /// exit path. If the returned future is dropped mid-flight, the guard's
    /// `Drop` still issues a best-effort release.
    pub async fn with_lock<F, Fut, T>(&self, session_id: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(session_id).await?;
        let output = f().await;
        guard.release().await;
        Ok(output)
    }

    /// One acquisition attempt. Store failures count as "held": the caller
    /// keeps retrying until the budget runs out.
    async fn try_acquire(&self, key: &str) -> Option<String> {
        match self.store.acquire_lock(key, self.ttl).await {
            Ok(result) => result,
            Err(err) => {
                warn!(key = %key, error = %err, "lock store unavailable, treating attempt as contended");
                None
            }
        }
    }
}

/// Double the delay, capped.
fn next_delay(delay: Duration, cap: Duration) -> Duration {
    (delay * 2).min(cap)
}

/// Scale a delay by a random factor in [0.9, 1.1] so concurrent waiters
/// do not retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::rng().random_range(0.9..=1.1))
}

/// Scoped lock acquisition.
///
/// Call [`release`](LockGuard::release) on the normal path. If the guard is
/// dropped without it (panic, cancellation), a best-effort release task is
/// spawned; the key's TTL covers the case where even that cannot run.
pub struct LockGuard {
    store: Arc<dyn CacheStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Release the lock, deleting the key only if we still own it.
    pub async fn release(mut self) {
        self.released = true;
        match self.store.release_lock(&self.key, &self.token).await {
            Ok(true) => trace!(key = %self.key, "lock released"),
            Ok(false) => warn!(key = %self.key, "lock already expired or taken over at release"),
            Err(err) => {
                // TTL expiry will free the key.
                warn!(key = %self.key, error = %err, "lock release failed, relying on TTL");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.release_lock(&key, &token).await;
            });
        }
        // No runtime: the key's TTL is the failsafe.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::MemoryCacheStore;

    fn lock_with(store: &Arc<MemoryCacheStore>, config: SessionConfig) -> DistributedLock {
        let store: Arc<dyn CacheStore> = Arc::clone(store) as Arc<dyn CacheStore>;
        DistributedLock::new(store, &config)
    }

    #[test]
    fn test_next_delay_doubles_to_cap() {
        let cap = Duration::from_millis(500);
        let mut delay = Duration::from_millis(10);
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay);
            delay = next_delay(delay, cap);
        }
        assert_eq!(seen[0], Duration::from_millis(10));
        assert_eq!(seen[1], Duration::from_millis(20));
        assert_eq!(seen[5], Duration::from_millis(320));
        assert_eq!(seen[6], Duration::from_millis(500));
        assert_eq!(seen[7], Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= Duration::from_millis(90), "jitter too low: {j:?}");
            assert!(j <= Duration::from_millis(110), "jitter too high: {j:?}");
        }
    }

    #[test]
    fn test_jitter_varies_across_calls() {
        let base = Duration::from_millis(100);
        let samples: Vec<Duration> = (0..16).map(|_| jittered(base)).collect();
        assert!(
            samples.iter().any(|s| *s != samples[0]),
            "all jittered delays identical"
        );
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = Arc::new(MemoryCacheStore::new());
        let lock = lock_with(&store, SessionConfig::default());

        let guard = lock.acquire("s1").await.unwrap();
        guard.release().await;

        // Released lock is immediately re-acquirable.
        let guard = lock.acquire("s1").await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_locks_on_different_sessions_are_independent() {
        let store = Arc::new(MemoryCacheStore::new());
        let lock = lock_with(&store, SessionConfig::default());

        let g1 = lock.acquire("s1").await.unwrap();
        let g2 = lock.acquire("s2").await.unwrap();
        g1.release().await;
        g2.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_waits_for_first_release() {
        let store = Arc::new(MemoryCacheStore::new());
        let lock = lock_with(&store, SessionConfig::default());

        let guard = lock.acquire("s1").await.unwrap();

        let contender = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let guard = lock.acquire("s1").await.unwrap();
                guard.release().await;
                started.elapsed()
            })
        };

        // Hold the lock long enough that the contender must retry at
        // least once before we release.
        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.release().await;

        let waited = contender.await.unwrap();
        assert!(
            waited >= Duration::from_millis(9),
            "contender acquired without waiting: {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_never_released() {
        let store = Arc::new(MemoryCacheStore::new());
        let config = SessionConfig::default()
            .with_lock_acquire_timeout(Duration::from_millis(200))
            .with_lock_ttl(Duration::from_secs(60));
        let lock = lock_with(&store, config);

        let _held = lock.acquire("s1").await.unwrap();

        let result = lock.acquire("s1").await;
        assert!(matches!(result, Err(LockError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_on_panic_unwind() {
        let store = Arc::new(MemoryCacheStore::new());
        let lock = lock_with(&store, SessionConfig::default());

        let panicked = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.with_lock("s1", || async {
                    panic!("boom");
                })
                .await
                .ok();
            })
        };
        assert!(panicked.await.is_err());

        // The guard's Drop released the lock, so a fresh acquire succeeds
        // without waiting for the TTL.
        let guard = lock.acquire("s1").await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_timeout() {
        let store = Arc::new(MemoryCacheStore::new());
        store.set_unavailable(true);
        let config = SessionConfig::default()
            .with_lock_acquire_timeout(Duration::from_millis(50));
        let lock = lock_with(&store, config);

        let result = lock.acquire("s1").await;
        assert!(matches!(result, Err(LockError::Timeout(_))));
    }
}
