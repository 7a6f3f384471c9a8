//! In-memory [`CacheStore`] implementation.
//!
//! Used by tests as a substitute for Redis and usable directly in
//! single-process deployments. Honors the same contract: TTL expiry,
//! order-preserving bulk reads, bounded scans, and atomic lock primitives
//! (atomicity here comes from holding the write guard across the
//! check-and-set).
//!
//! Time is measured with [`tokio::time::Instant`] so TTL behavior can be
//! exercised under a paused virtual clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::store::CacheStore;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory cache store with per-entry TTL.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Entry>>,

    /// When set, every operation fails with [`CacheError::Unavailable`].
    /// Lets tests simulate a store outage.
    unavailable: AtomicBool,

    /// Number of underlying batched fetches performed by `get_many`.
    batched_fetches: AtomicU64,
}

impl MemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of batched fetches `get_many` has performed.
    pub fn batched_fetches(&self) -> u64 {
        self.batched_fetches.load(Ordering::SeqCst)
    }

    /// Number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }

    /// Whether the store holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Match a key against a glob-style pattern.
///
/// Only the patterns the coordination layer actually uses are supported: a
/// literal key, or a literal prefix followed by a trailing `*`.
fn key_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_available()?;
        // One guard acquisition = one batched fetch.
        let entries = self.entries.read().await;
        self.batched_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|e| !e.is_expired())
                    .map(|e| e.value.clone())
            })
            .collect())
    }

    async fn scan_keys(&self, pattern: &str, max_keys: usize) -> Result<Vec<String>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && key_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys.truncate(max_keys);
        Ok(keys)
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_expired()) {
            trace!(key = %key, "lock already held");
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        entries.insert(key.to_string(), Entry::new(token.clone().into_bytes(), ttl));
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let held_by_caller = entries
            .get(key)
            .is_some_and(|e| !e.is_expired() && e.value == token.as_bytes());
        if held_by_caller {
            entries.remove(key);
        }
        Ok(held_by_caller)
    }
}
