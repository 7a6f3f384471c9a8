//! Shared-store key layout.
//!
//! Every ephemeral record about a session lives under one of these
//! prefixes. Keys are namespaced by purpose so TTLs and scans never mix
//! projections with locks or markers.

/// Cached projection of the durable session row.
pub(crate) fn projection(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Pattern matching every cached projection.
pub(crate) const PROJECTION_PATTERN: &str = "session:*";

/// Mutation lock for a session.
pub(crate) fn lock(session_id: &str) -> String {
    format!("session_lock:{session_id}")
}

/// Liveness marker: an in-flight stream exists somewhere in the cluster.
pub(crate) fn active(session_id: &str) -> String {
    format!("active_session:{session_id}")
}

/// Interrupt marker: cancellation was requested on some instance.
pub(crate) fn interrupted(session_id: &str) -> String {
    format!("interrupted:{session_id}")
}
