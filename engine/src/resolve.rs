//! Conflict resolution strategies.
//!
//! Given the two sides of a detected conflict (plus the common base the
//! client edited from), the resolver applies strategies in a fixed
//! precedence order:
//!
//! 1. Tombstone precedence - a delete on either side wins
//! 2. Completion precedence - a completed binary flag wins (completion is
//!    irreversible in the real world)
//! 3. Field-level merge - disjoint change-sets against the common base
//!    merge losslessly
//! 4. Last-writer-wins - overlapping edits with no domain rule
//! 5. Manual review - types flagged in the [`SyncSchema`] policy
//!
//! Resolution is a pure function of its inputs; every detected conflict
//! produces a [`ConflictRecord`] even when resolved automatically.

use crate::{
    schema::SyncSchema, ConflictId, EntityId, EntityType, Error, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Which strategy settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    Tombstone,
    Completion,
    FieldMerge,
    LastWriterWins,
    ManualReview,
}

/// The two sides of a conflict, plus the common base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSides {
    /// Entity type under conflict
    pub entity_type: EntityType,
    /// Entity ID under conflict
    pub entity_id: EntityId,
    /// Server version the client's edits were based on
    pub base_version: Version,
    /// Payload at that base, if retained (absent for never-synced creates)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_payload: Option<Value>,
    /// Client-side payload; `None` means the client deleted the entity
    pub client_payload: Option<Value>,
    /// When the client made its change
    pub client_timestamp: Timestamp,
    /// Server-side payload; `None` means the server deleted the entity
    pub server_payload: Option<Value>,
    /// Server version of the competing state
    pub server_version: Version,
    /// Server-side last update time
    pub server_updated_at: Timestamp,
}

/// The state a resolved conflict settles on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ResolvedState {
    /// The entity ends deleted
    Deleted,
    /// The entity ends with this payload
    Payload { payload: Value },
}

/// Outcome of running the strategy chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Resolved automatically
    Auto {
        strategy: Strategy,
        state: ResolvedState,
    },
    /// Requires human judgment; the lane is held until a choice arrives
    Manual,
}

/// Audit record of a detected conflict.
///
/// Created for every conflict, automatic or not. Manual-review records
/// stay unresolved until the presenter reports a choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Unique record ID
    pub id: ConflictId,
    /// Entity type under conflict
    pub entity_type: EntityType,
    /// Entity ID under conflict
    pub entity_id: EntityId,
    /// Client's base version at detection time
    pub client_version: Version,
    /// Server version at detection time
    pub server_version: Version,
    /// Client-side data (None = client deleted)
    pub client_data: Option<Value>,
    /// Server-side data (None = server deleted)
    pub server_data: Option<Value>,
    /// When the conflict was detected
    pub detected_at: Timestamp,
    /// Strategy that settled it, if automatic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_applied: Option<Strategy>,
    /// Whether the conflict has been settled
    pub resolved: bool,
}

impl ConflictRecord {
    /// Build the audit record for a conflict and its resolution.
    pub fn new(
        id: impl Into<ConflictId>,
        sides: &ConflictSides,
        detected_at: Timestamp,
        resolution: &Resolution,
    ) -> Self {
        let (strategy_applied, resolved) = match resolution {
            Resolution::Auto { strategy, .. } => (Some(*strategy), true),
            Resolution::Manual => (None, false),
        };
        Self {
            id: id.into(),
            entity_type: sides.entity_type.clone(),
            entity_id: sides.entity_id.clone(),
            client_version: sides.base_version,
            server_version: sides.server_version,
            client_data: sides.client_payload.clone(),
            server_data: sides.server_payload.clone(),
            detected_at,
            strategy_applied,
            resolved,
        }
    }
}

/// The resolver applies the strategy precedence chain.
pub struct Resolver<'a> {
    schema: &'a SyncSchema,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over the given schema's type policies.
    pub fn new(schema: &'a SyncSchema) -> Self {
        Self { schema }
    }

    /// Run the strategy chain for one conflict.
    pub fn resolve(&self, sides: &ConflictSides) -> crate::error::Result<Resolution> {
        let policy = self.schema.policy(&sides.entity_type)?;

        // 1. Tombstone precedence. Applies even to manual-review types:
        //    a delete is unambiguous and irreversible.
        if sides.client_payload.is_none() || sides.server_payload.is_none() {
            return Ok(Resolution::Auto {
                strategy: Strategy::Tombstone,
                state: ResolvedState::Deleted,
            });
        }

        let client = sides.client_payload.as_ref().ok_or(Error::EmptyConflict)?;
        let server = sides.server_payload.as_ref().ok_or(Error::EmptyConflict)?;

        // 5 (short-circuit). Flagged types skip the automatic strategies:
        // both sides survive in the record for the presenter.
        if policy.manual_review {
            return Ok(Resolution::Manual);
        }

        // 2. Completion precedence.
        let client_done = policy.is_completed(client);
        let server_done = policy.is_completed(server);
        if client_done != server_done {
            let winner = if client_done { client } else { server };
            return Ok(Resolution::Auto {
                strategy: Strategy::Completion,
                state: ResolvedState::Payload {
                    payload: winner.clone(),
                },
            });
        }

        // 3. Field-level merge of disjoint change-sets.
        if let Some(base) = sides.base_payload.as_ref() {
            if let (Some(base), Some(client_obj), Some(server_obj)) =
                (base.as_object(), client.as_object(), server.as_object())
            {
                let client_changes = changed_fields(base, client_obj);
                let server_changes = changed_fields(base, server_obj);
                if !client_changes.is_empty()
                    && !server_changes.is_empty()
                    && client_changes.is_disjoint(&server_changes)
                {
                    let merged =
                        merge_disjoint(base, client_obj, server_obj, &client_changes, &server_changes);
                    return Ok(Resolution::Auto {
                        strategy: Strategy::FieldMerge,
                        state: ResolvedState::Payload {
                            payload: Value::Object(merged),
                        },
                    });
                }
            }
        }

        // 4. Last-writer-wins; ties go to the server (already durable).
        let state = if sides.client_timestamp > sides.server_updated_at {
            ResolvedState::Payload {
                payload: client.clone(),
            }
        } else {
            ResolvedState::Payload {
                payload: server.clone(),
            }
        };
        Ok(Resolution::Auto {
            strategy: Strategy::LastWriterWins,
            state,
        })
    }
}

/// Top-level fields whose value differs from the base (changed, added, or
/// removed).
fn changed_fields(base: &Map<String, Value>, side: &Map<String, Value>) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (key, value) in side {
        if base.get(key) != Some(value) {
            changed.insert(key.clone());
        }
    }
    for key in base.keys() {
        if !side.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed
}

/// Apply both disjoint change-sets on top of the base.
fn merge_disjoint(
    base: &Map<String, Value>,
    client: &Map<String, Value>,
    server: &Map<String, Value>,
    client_changes: &BTreeSet<String>,
    server_changes: &BTreeSet<String>,
) -> Map<String, Value> {
    let mut merged = base.clone();
    for key in server_changes {
        match server.get(key) {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    for key in client_changes {
        match client.get(key) {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged
}
