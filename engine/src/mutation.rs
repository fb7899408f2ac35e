//! Mutations - durable records of pending local operations.
//!
//! Changes are expressed as mutations, not direct writes to the server.
//! Each mutation carries an idempotency key so retried pushes can be
//! deduplicated server-side, and a status state machine that the queue
//! enforces.

use crate::{EntityId, EntityType, Error, MutationId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// What kind of change a mutation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a mutation.
///
/// `Pending -> InFlight -> { Acked; Conflict; back to Pending (retry) or
/// FailedTerminal }`. Terminal states are `Acked` and `FailedTerminal`.
/// Backoff waiting is a `Pending` mutation with `not_before` in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Acked,
    Conflict,
    FailedTerminal,
}

impl MutationStatus {
    /// Static name, used in transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "Pending",
            MutationStatus::InFlight => "InFlight",
            MutationStatus::Acked => "Acked",
            MutationStatus::Conflict => "Conflict",
            MutationStatus::FailedTerminal => "FailedTerminal",
        }
    }

    /// Whether this status permits moving to `to`.
    pub fn can_transition(self, to: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (InFlight, Acked)
                | (InFlight, Conflict)
                | (InFlight, Pending)
                | (InFlight, FailedTerminal)
                | (Conflict, Pending)
        )
    }
}

/// A pending local operation, queued for push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Idempotency key - unique per mutation, stable across retries
    pub id: MutationId,
    /// Entity type this mutation targets
    pub entity_type: EntityType,
    /// Entity ID this mutation targets
    pub entity_id: EntityId,
    /// Kind of change
    pub kind: MutationKind,
    /// Snapshot of the payload at enqueue time (None for deletes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Server version the change was based on (0 for creates)
    pub base_version: Version,
    /// When the client made the change (milliseconds since epoch)
    pub client_timestamp: Timestamp,
    /// Number of push attempts made so far
    pub attempt: u32,
    /// Current lifecycle status
    pub status: MutationStatus,
    /// Earliest dispatch time while backing off (None = immediately eligible)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<Timestamp>,
}

impl Mutation {
    /// Build a create mutation.
    pub fn create(
        id: impl Into<MutationId>,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        client_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind: MutationKind::Create,
            payload: Some(payload),
            base_version: 0,
            client_timestamp,
            attempt: 0,
            status: MutationStatus::Pending,
            not_before: None,
        }
    }

    /// Build an update mutation.
    pub fn update(
        id: impl Into<MutationId>,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        base_version: Version,
        client_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind: MutationKind::Update,
            payload: Some(payload),
            base_version,
            client_timestamp,
            attempt: 0,
            status: MutationStatus::Pending,
            not_before: None,
        }
    }

    /// Build a delete mutation.
    pub fn delete(
        id: impl Into<MutationId>,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        base_version: Version,
        client_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind: MutationKind::Delete,
            payload: None,
            base_version,
            client_timestamp,
            attempt: 0,
            status: MutationStatus::Pending,
            not_before: None,
        }
    }

    /// Transition to a new status, validating against the state machine.
    pub fn transition(&mut self, to: MutationStatus) -> crate::error::Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status.name(),
                to: to.name(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Whether this mutation may be dispatched at `now`.
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.status == MutationStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }
}
