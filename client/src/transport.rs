//! The wire interface to the sync server.
//!
//! The orchestrator talks to the backend only through [`SyncTransport`];
//! the concrete implementation (HTTP, gRPC, a test double) is injected at
//! construction. Transport failures are reported as
//! [`Error::Transport`](crate::Error::Transport) and retried under the
//! backoff policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_engine::{Cursor, Mutation, MutationId, ServerEntity, Timestamp, Version};

use crate::error::Result;

/// One page of server deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPage {
    /// Entities changed since the requested cursor, in commit order
    pub entities: Vec<ServerEntity>,
    /// Cursor to persist once this page is durably applied
    pub next_cursor: Cursor,
    /// Whether more pages are immediately available
    pub has_more: bool,
}

/// Why the server refused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectCode {
    /// Retryable server-side trouble (overload, storage hiccup)
    Transient,
    /// The payload failed server-side validation
    MalformedPayload,
    /// The caller may not touch this entity
    Unauthorized,
    /// The server does not know this entity type
    UnknownEntityType,
}

impl RejectCode {
    /// Transient rejections re-enter the backoff loop; the rest are
    /// immediately terminal.
    pub fn is_transient(self) -> bool {
        matches!(self, RejectCode::Transient)
    }
}

/// Per-mutation outcome of a push request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum PushOutcome {
    /// Applied; the entity now has this server version
    Acked {
        id: MutationId,
        version: Version,
        updated_at: Timestamp,
    },
    /// Version check failed; the server's current state is attached
    Conflict {
        id: MutationId,
        /// None when the server's copy is deleted
        server_payload: Option<Value>,
        server_version: Version,
        server_updated_at: Timestamp,
    },
    /// Refused outright
    Rejected {
        id: MutationId,
        code: RejectCode,
        reason: String,
    },
}

impl PushOutcome {
    /// The mutation this outcome refers to.
    pub fn mutation_id(&self) -> &str {
        match self {
            PushOutcome::Acked { id, .. }
            | PushOutcome::Conflict { id, .. }
            | PushOutcome::Rejected { id, .. } => id,
        }
    }
}

/// Client-to-server sync protocol.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetch entities changed since `cursor`, at most `limit` of them.
    async fn pull(&self, cursor: &Cursor, limit: usize) -> Result<PullPage>;

    /// Submit a batch of mutations. The response carries one outcome per
    /// submitted mutation; mutation IDs double as idempotency keys, so
    /// resubmitting an already-applied mutation yields its original
    /// outcome without applying it twice.
    async fn push(&self, batch: &[Mutation]) -> Result<Vec<PushOutcome>>;
}
