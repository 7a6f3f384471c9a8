//! Redis-backed [`CacheStore`] implementation.
//!
//! One [`ConnectionManager`] per process: a single multiplexed connection
//! shared by every coroutine, which reconnects on failure. All failures
//! surface as [`CacheError::Unavailable`] so callers can degrade to the
//! repository path.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::store::CacheStore;

/// Release only if the key still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// How many keys each SCAN iteration asks the server for.
const SCAN_BATCH: usize = 100;

/// Redis-backed cache store.
pub struct RedisCacheStore {
    conn: ConnectionManager,
    release_script: Script,
}

impl RedisCacheStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(to_cache_error)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(to_cache_error)?;
        debug!(url = %url, "connected to redis");
        Ok(Self::with_connection(conn))
    }

    /// Build a store over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

fn to_cache_error(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is an error on the server; clamp to the smallest expirable value.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(to_cache_error)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(to_cache_error)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(to_cache_error)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // A single MGET round trip regardless of key count.
        let values: Vec<Value> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        // Per-slot decode failure maps to None instead of failing the call.
        Ok(values
            .iter()
            .map(|v| redis::from_redis_value::<Option<Vec<u8>>>(v).unwrap_or(None))
            .collect())
    }

    async fn scan_keys(&self, pattern: &str, max_keys: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(to_cache_error)?;
            keys.extend(batch);
            if keys.len() >= max_keys || next == 0 {
                break;
            }
            cursor = next;
        }
        keys.truncate(max_keys);
        Ok(keys)
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        // SET NX PX is the atomic "set if absent with expiry".
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        Ok(acquired.map(|_| token))
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(to_cache_error)?;
        Ok(deleted == 1)
    }
}
