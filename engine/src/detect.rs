//! Conflict detection for incoming server snapshots.
//!
//! A pure classification: most pulls are non-conflicting background
//! refreshes, and only a dirty local entity whose base has been overtaken
//! on the server is a real conflict.

use crate::{Entity, EntityId, EntityType, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// An entity snapshot as the server reports it in a pull delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntity {
    /// Domain type
    pub entity_type: EntityType,
    /// Unique identifier within the entity type
    pub id: EntityId,
    /// Server-assigned version
    pub version: Version,
    /// Server-side last update time
    pub updated_at: Timestamp,
    /// Whether the server has this entity deleted
    pub deleted: bool,
    /// Opaque payload
    pub payload: serde_json::Value,
}

/// How to handle one pulled server snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullClass {
    /// Overwrite the local snapshot; no conflict, no record
    Apply,
    /// Local unsynced edits exist on an outdated base: resolve
    Conflict,
    /// Nothing new (echo of known state); skip entirely
    Ignore,
}

/// Classify an incoming server snapshot against the local entity.
///
/// Conflict exists iff the local entity is dirty AND the server's version
/// differs from the base version recorded at edit time. A clean local
/// entity is simply refreshed; a snapshot matching what we already know
/// is ignored.
pub fn classify(server: &ServerEntity, local: Option<&Entity>) -> PullClass {
    let Some(local) = local else {
        return PullClass::Apply;
    };

    if local.dirty {
        if server.version == local.base_version() {
            // The exact state our edits are based on; the push path will
            // reconcile, nothing to do here.
            PullClass::Ignore
        } else {
            PullClass::Conflict
        }
    } else if server.version == local.version && server.deleted == local.deleted {
        PullClass::Ignore
    } else {
        PullClass::Apply
    }
}
