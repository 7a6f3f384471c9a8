//! Distributed session coordination layer for Relay.
//!
//! Lets many stateless API processes share one logical notion of "agent
//! conversation session" without any process holding authoritative
//! in-memory state:
//!
//! - [`SessionRepository`]: durable source of truth (Postgres in
//!   production, in-memory for tests)
//! - a cached projection of each session in the shared store, read
//!   cache-aside and invalidated on write
//! - [`DistributedLock`]: cluster-wide mutual exclusion for mutation,
//!   TTL-bounded as a crash failsafe
//! - [`ActiveSessionTracker`]: cluster-visible liveness and interrupt
//!   markers, polled by whichever process is streaming a session
//! - [`SessionService`]: the façade composing the above into the
//!   ownership-enforced session lifecycle
//!
//! The shared store is allowed to fail (every path degrades to the
//! repository); the repository is not.

mod config;
mod error;
mod keys;
mod lock;
mod model;
mod postgres;
mod repository;
mod service;
mod tracker;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use lock::{DistributedLock, LockError, LockGuard};
pub use model::{Session, SessionStatus, SessionUpdate};
pub use postgres::PostgresSessionRepository;
pub use repository::{MemorySessionRepository, RepositoryError, SessionRepository};
pub use service::{SessionService, hash_api_key};
pub use tracker::ActiveSessionTracker;
