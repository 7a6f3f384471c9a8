//! Durable session storage.
//!
//! The repository is the source of truth for session state. Unlike the
//! shared store, its failures are never masked: a repository error always
//! propagates to the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{Session, SessionUpdate};

/// Error type for durable-store operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be mapped back to a session.
    #[error("corrupt session row: {0}")]
    Corrupt(String),
}

/// Result type for durable-store operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Durable CRUD over session records.
///
/// All mutations are transactional: a failed write rolls back fully and
/// readers never observe a partial field update.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session. The caller assigns the id.
    async fn create(&self, session: Session) -> Result<Session>;

    /// Fetch a session by id.
    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Atomically apply a partial update and return the new row.
    ///
    /// `Ok(None)` when no row with this id exists. Returning the updated
    /// row saves callers a separate read-after-write.
    async fn update(&self, id: &str, update: SessionUpdate) -> Result<Option<Session>>;

    /// List sessions, newest first, with the total matching count.
    ///
    /// With `owner_hash` set this is an indexed query on the owner column;
    /// other tenants' rows are never loaded into the process.
    async fn list(
        &self,
        owner_hash: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<Session>, u64)>;
}

/// In-memory [`SessionRepository`] for tests and single-process use.
#[derive(Debug, Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).cloned())
    }

    async fn update(&self, id: &str, update: SessionUpdate) -> Result<Option<Session>> {
        // The write guard spans read-modify-write, matching the atomicity
        // of the Postgres single-statement UPDATE.
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(id).map(|session| {
            update.apply(session);
            session.clone()
        }))
    }

    async fn list(
        &self,
        owner_hash: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<Session>, u64)> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|s| match owner_hash {
                Some(owner) => s.owner_api_key_hash.as_deref() == Some(owner),
                None => true,
            })
            .cloned()
            .collect();
        // Newest first, id as tiebreaker for a stable order.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((items, total))
    }
}
