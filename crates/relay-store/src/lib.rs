//! Shared ephemeral key/value store abstraction for Relay.
//!
//! This crate defines the [`CacheStore`] trait that every Relay process uses
//! to talk to the cluster-shared ephemeral store, plus two implementations:
//!
//! - [`RedisCacheStore`]: the production backend, one multiplexed connection
//!   shared by all coroutines in a process
//! - [`MemoryCacheStore`]: an in-process backend for tests and
//!   single-process deployments
//!
//! Everything stored here is reconstructable or advisory: session
//! projections, mutation locks, and liveness markers. Durable session state
//! lives in the repository, never here.

mod error;
mod memory;
mod redis_store;
mod store;

pub use error::{CacheError, Result};
pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;
pub use store::CacheStore;
