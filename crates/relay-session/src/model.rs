//! Session domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a session.
///
/// `Completed` and `Error` are terminal: normal operations never move a
/// session back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The session can still run turns.
    Active,
    /// The session finished normally.
    Completed,
    /// The session finished with a failure.
    Error,
}

impl SessionStatus {
    /// Stable string form, matching the stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// A durable agent conversation session.
///
/// The repository row is the source of truth; the serialized form of this
/// struct is also what gets cached as the shared-store projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique identifier, assigned at creation.
    pub id: String,

    /// Lifecycle status.
    pub status: SessionStatus,

    /// Backing model identifier, immutable after creation.
    pub model: String,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// Advances on every mutation.
    pub updated_at: DateTime<Utc>,

    /// Turns executed so far, incremented at turn boundaries.
    pub total_turns: i64,

    /// Accumulated cost. `None` until the first turn reports cost.
    pub total_cost_usd: Option<f64>,

    /// Fork lineage: the session this one was forked from.
    pub parent_session_id: Option<String>,

    /// Owner tenant identifier (hashed API key). `None` means public.
    pub owner_api_key_hash: Option<String>,

    /// Opaque attributes, not interpreted by the coordination layer.
    pub metadata: Value,
}

impl Session {
    /// Create a new active session with a fresh id.
    pub fn new(
        model: impl Into<String>,
        parent_session_id: Option<String>,
        owner_api_key_hash: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            model: model.into(),
            created_at: now,
            updated_at: now,
            total_turns: 0,
            total_cost_usd: None,
            parent_session_id,
            owner_api_key_hash,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    /// Whether the session is public (no owner recorded).
    pub fn is_public(&self) -> bool {
        self.owner_api_key_hash.is_none()
    }
}

/// Partial-field mutation applied by [`SessionRepository::update`].
///
/// Counters are expressed as deltas, not absolute values, so concurrent
/// writers serialized by the distributed lock never lose increments made
/// by a writer they did not read. Negative deltas are clamped to zero at
/// application: `total_turns` stays non-negative and `total_cost_usd`
/// never decreases.
///
/// [`SessionRepository::update`]: crate::SessionRepository::update
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// New status, if changing.
    pub status: Option<SessionStatus>,

    /// Turns to add to `total_turns`.
    pub turns_delta: i64,

    /// Cost to add to `total_cost_usd` (treated as 0 when unset so far).
    pub cost_delta: Option<f64>,

    /// Replacement metadata blob, if changing.
    pub metadata: Option<Value>,
}

impl SessionUpdate {
    /// An update that changes nothing but `updated_at`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session status.
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Add completed turns to the counter. Negative amounts are ignored.
    pub fn add_turns(mut self, turns: i64) -> Self {
        self.turns_delta += turns.max(0);
        self
    }

    /// Add cost to the accumulator. Negative amounts are ignored.
    pub fn add_cost(mut self, cost_usd: f64) -> Self {
        self.cost_delta = Some(self.cost_delta.unwrap_or(0.0) + cost_usd.max(0.0));
        self
    }

    /// Replace the metadata blob.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Apply this update to an in-memory session, advancing `updated_at`.
    ///
    /// The in-memory repository uses this; the Postgres repository applies
    /// the same semantics in a single UPDATE statement.
    pub(crate) fn apply(&self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        // Clamp here as well: the delta fields are public, so the builder
        // alone cannot guarantee the counters never move backward.
        session.total_turns = session
            .total_turns
            .saturating_add(self.turns_delta.max(0))
            .max(0);
        if let Some(cost) = self.cost_delta {
            let previous = session.total_cost_usd.unwrap_or(0.0);
            session.total_cost_usd = Some(previous + cost.max(0.0));
        }
        if let Some(metadata) = &self.metadata {
            session.metadata = metadata.clone();
        }
        session.updated_at = Utc::now();
    }
}
