//! Sync cursor and per-cycle session counters.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Opaque token marking the point up to which server deltas have been
/// durably applied locally. The empty cursor means "from the beginning".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    /// The initial cursor, before any pull has been committed.
    pub fn start() -> Self {
        Self(String::new())
    }

    /// Whether this is the initial cursor.
    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw token, as sent to the server.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Cursor {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_start() {
            write!(f, "<start>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Ephemeral per-cycle counters, for observability and tests.
/// Never persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    /// When the cycle started (milliseconds since epoch)
    pub started_at: Timestamp,
    /// Server entities applied or resolved from pull pages
    pub pulled: u64,
    /// Mutations acknowledged by the server
    pub pushed: u64,
    /// Conflicts detected (automatic and manual)
    pub conflicts_found: u64,
    /// Transient errors encountered (retried under backoff)
    pub errors: u64,
}

impl SyncSession {
    /// Start counting a new cycle.
    pub fn start(now: Timestamp) -> Self {
        Self {
            started_at: now,
            pulled: 0,
            pushed: 0,
            conflicts_found: 0,
            errors: 0,
        }
    }
}
