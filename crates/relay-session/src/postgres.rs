//! Postgres-backed [`SessionRepository`].
//!
//! One bounded [`PgPool`] per process, shared by all coroutines. Partial
//! updates are a single `UPDATE ... RETURNING` statement so the new row
//! comes back atomically with the write, and counter columns are advanced
//! in-place (`total_turns = total_turns + $n`) rather than overwritten.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::debug;

use crate::model::{Session, SessionUpdate};
use crate::repository::{RepositoryError, Result, SessionRepository};

/// Default size of the connection pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY,
    status             TEXT NOT NULL,
    model              TEXT NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL,
    updated_at         TIMESTAMPTZ NOT NULL,
    total_turns        BIGINT NOT NULL DEFAULT 0,
    total_cost_usd     DOUBLE PRECISION,
    parent_session_id  TEXT REFERENCES sessions(id),
    owner_api_key_hash TEXT,
    metadata           JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS idx_sessions_owner_api_key_hash
    ON sessions (owner_api_key_hash);
"#;

const COLUMNS: &str = "id, status, model, created_at, updated_at, total_turns, \
                       total_cost_usd, parent_session_id, owner_api_key_hash, metadata";

/// Postgres-backed session repository.
pub struct PostgresSessionRepository {
    pool: PgPool,
}

impl PostgresSessionRepository {
    /// Connect with a bounded pool and run the schema migration.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let repo = Self::with_pool(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    /// Build a repository over an existing pool. Does not migrate.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the sessions schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("sessions schema migrated");
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_session(row: &PgRow) -> Result<Session> {
    let status: String = row.try_get("status")?;
    let status = status.parse().map_err(RepositoryError::Corrupt)?;
    Ok(Session {
        id: row.try_get("id")?,
        status,
        model: row.try_get("model")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        total_turns: row.try_get("total_turns")?,
        total_cost_usd: row.try_get("total_cost_usd")?,
        parent_session_id: row.try_get("parent_session_id")?,
        owner_api_key_hash: row.try_get("owner_api_key_hash")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn create(&self, session: Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO sessions (id, status, model, created_at, updated_at, total_turns, \
             total_cost_usd, parent_session_id, owner_api_key_hash, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&session.id)
        .bind(session.status.as_str())
        .bind(&session.model)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.total_turns)
        .bind(session.total_cost_usd)
        .bind(&session.parent_session_id)
        .bind(&session.owner_api_key_hash)
        .bind(&session.metadata)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sessions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn update(&self, id: &str, update: SessionUpdate) -> Result<Option<Session>> {
        let mut qb = QueryBuilder::new("UPDATE sessions SET updated_at = ");
        qb.push_bind(Utc::now());
        // GREATEST mirrors the clamping in SessionUpdate::apply: counters
        // never move backward even if a raw negative delta reaches us.
        qb.push(", total_turns = GREATEST(total_turns + GREATEST(");
        qb.push_bind(update.turns_delta);
        qb.push(", 0), 0)");
        if let Some(status) = update.status {
            qb.push(", status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(cost) = update.cost_delta {
            qb.push(", total_cost_usd = COALESCE(total_cost_usd, 0) + GREATEST(");
            qb.push_bind(cost);
            qb.push(", 0)");
        }
        if let Some(metadata) = update.metadata {
            qb.push(", metadata = ");
            qb.push_bind(metadata);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.push(format!(" RETURNING {COLUMNS}"));

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list(
        &self,
        owner_hash: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<(Vec<Session>, u64)> {
        // The owner filter rides the owner_api_key_hash index; unrelated
        // tenants' rows never reach this process.
        let (total, rows) = match owner_hash {
            Some(owner) => {
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM sessions WHERE owner_api_key_hash = $1",
                )
                .bind(owner)
                .fetch_one(&self.pool)
                .await?;
                let rows = sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sessions WHERE owner_api_key_hash = $1 \
                     ORDER BY created_at DESC, id LIMIT $2 OFFSET $3"
                ))
                .bind(owner)
                .bind(i64::from(limit))
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
                    .fetch_one(&self.pool)
                    .await?;
                let rows = sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sessions \
                     ORDER BY created_at DESC, id LIMIT $1 OFFSET $2"
                ))
                .bind(i64::from(limit))
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };

        let sessions = rows
            .iter()
            .map(row_to_session)
            .collect::<Result<Vec<_>>>()?;
        Ok((sessions, total as u64))
    }
}
