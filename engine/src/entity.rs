//! Entity snapshots held in the local store.

use crate::{EntityId, EntityType, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// The last server-acknowledged state of an entity, retained while the
/// entity carries unsynced local edits. The resolver uses it to compute
/// which fields each side changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseState {
    /// Server version this base corresponds to (0 for never-synced creates)
    pub version: Version,
    /// Payload as the server last acknowledged it
    pub payload: serde_json::Value,
}

/// A locally persisted entity snapshot plus sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Domain type ("task", "event", ...), opaque to the engine
    pub entity_type: EntityType,
    /// Unique identifier within the entity type
    pub id: EntityId,
    /// Server-assigned version; only advances via server acknowledgment
    pub version: Version,
    /// Last modification time (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Whether local edits exist that the server has not acknowledged
    pub dirty: bool,
    /// Soft-delete marker, retained until the server confirms the delete
    pub deleted: bool,
    /// The actual data payload (opaque JSON object)
    pub payload: serde_json::Value,
    /// Last acknowledged state, present only while dirty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<BaseState>,
}

impl Entity {
    /// Create a brand-new local entity that the server has never seen.
    pub fn new_local(
        entity_type: impl Into<EntityType>,
        id: impl Into<EntityId>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            version: 0,
            updated_at: timestamp,
            dirty: true,
            deleted: false,
            payload,
            base: None,
        }
    }

    /// Create an entity from a server snapshot (clean, nothing pending).
    pub fn from_server(
        entity_type: impl Into<EntityType>,
        id: impl Into<EntityId>,
        payload: serde_json::Value,
        version: Version,
        updated_at: Timestamp,
        deleted: bool,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            version,
            updated_at,
            dirty: false,
            deleted,
            payload,
            base: None,
        }
    }

    /// Check if the entity is active (not tombstoned).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// The version the current local edits are based on.
    ///
    /// While clean this is simply the entity's version; while dirty it is
    /// the retained base's version.
    pub fn base_version(&self) -> Version {
        match &self.base {
            Some(base) => base.version,
            None => self.version,
        }
    }

    /// Apply a local edit: replace the payload, mark dirty, and retain the
    /// previous acknowledged state as the merge base if not already dirty.
    pub fn edit(&mut self, payload: serde_json::Value, timestamp: Timestamp) {
        if !self.dirty {
            self.base = Some(BaseState {
                version: self.version,
                payload: self.payload.clone(),
            });
        }
        self.payload = payload;
        self.updated_at = timestamp;
        self.dirty = true;
    }

    /// Apply a local delete: tombstone the entity, retaining the base like
    /// [`Entity::edit`] so a competing server update can be audited.
    pub fn tombstone(&mut self, timestamp: Timestamp) {
        if !self.dirty {
            self.base = Some(BaseState {
                version: self.version,
                payload: self.payload.clone(),
            });
        }
        self.deleted = true;
        self.updated_at = timestamp;
        self.dirty = true;
    }

    /// Absorb a clean server snapshot: overwrite payload and metadata,
    /// clear the dirty flag and the retained base.
    pub fn absorb_server(
        &mut self,
        payload: serde_json::Value,
        version: Version,
        updated_at: Timestamp,
        deleted: bool,
    ) {
        self.payload = payload;
        self.version = version;
        self.updated_at = updated_at;
        self.deleted = deleted;
        self.dirty = false;
        self.base = None;
    }

    /// Record a server acknowledgment of the local state.
    ///
    /// The payload stays as-is (the server accepted it); version and
    /// timestamp come from the server response. If `lane_empty` the entity
    /// becomes clean and the base is dropped; otherwise later queued edits
    /// are still pending and the base is re-anchored to `acked_payload`,
    /// the snapshot the server just accepted - not the current local
    /// payload, which may already carry those later edits.
    pub fn acknowledge(
        &mut self,
        version: Version,
        updated_at: Timestamp,
        acked_payload: Option<&serde_json::Value>,
        lane_empty: bool,
    ) {
        self.version = version;
        self.updated_at = updated_at;
        if lane_empty {
            self.dirty = false;
            self.base = None;
        } else {
            self.base = Some(BaseState {
                version,
                payload: acked_payload.cloned().unwrap_or_else(|| self.payload.clone()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_local_entity_is_dirty_unversioned() {
        let entity = Entity::new_local("tasks", "t-1", json!({"title": "Dishes"}), 1000);
        assert_eq!(entity.version, 0);
        assert!(entity.dirty);
        assert!(entity.is_active());
        assert!(entity.base.is_none());
        assert_eq!(entity.base_version(), 0);
    }

    #[test]
    fn edit_retains_base_once() {
        let mut entity =
            Entity::from_server("tasks", "t-1", json!({"title": "Dishes"}), 3, 1000, false);
        entity.edit(json!({"title": "Dishes", "done": true}), 2000);

        let base = entity.base.as_ref().unwrap();
        assert_eq!(base.version, 3);
        assert_eq!(base.payload, json!({"title": "Dishes"}));
        assert_eq!(entity.base_version(), 3);

        // A second edit must not move the base
        entity.edit(json!({"title": "Dishes!", "done": true}), 3000);
        assert_eq!(entity.base.as_ref().unwrap().version, 3);
        assert_eq!(
            entity.base.as_ref().unwrap().payload,
            json!({"title": "Dishes"})
        );
    }

    #[test]
    fn tombstone_marks_deleted_and_dirty() {
        let mut entity =
            Entity::from_server("events", "e-1", json!({"name": "Picnic"}), 2, 1000, false);
        entity.tombstone(2000);

        assert!(entity.deleted);
        assert!(entity.dirty);
        assert_eq!(entity.base.as_ref().unwrap().version, 2);
    }

    #[test]
    fn absorb_server_clears_dirty_state() {
        let mut entity =
            Entity::from_server("tasks", "t-1", json!({"title": "Dishes"}), 1, 1000, false);
        entity.edit(json!({"title": "Plates"}), 2000);

        entity.absorb_server(json!({"title": "Bowls"}), 5, 3000, false);
        assert_eq!(entity.version, 5);
        assert!(!entity.dirty);
        assert!(entity.base.is_none());
        assert_eq!(entity.payload, json!({"title": "Bowls"}));
    }

    #[test]
    fn acknowledge_with_empty_lane_goes_clean() {
        let mut entity = Entity::new_local("tasks", "t-1", json!({"title": "Dishes"}), 1000);
        entity.acknowledge(1, 1500, Some(&json!({"title": "Dishes"})), true);

        assert_eq!(entity.version, 1);
        assert!(!entity.dirty);
        assert!(entity.base.is_none());
    }

    #[test]
    fn acknowledge_with_pending_lane_anchors_base_to_acked_snapshot() {
        // The create ("Dishes") is acked while a later edit ("Plates") is
        // still queued: the merge base must be the state the server holds,
        // not the local payload that already contains the pending edit.
        let mut entity = Entity::new_local("tasks", "t-1", json!({"title": "Dishes"}), 1000);
        entity.edit(json!({"title": "Plates"}), 1200);

        entity.acknowledge(1, 1500, Some(&json!({"title": "Dishes"})), false);
        assert_eq!(entity.version, 1);
        assert!(entity.dirty);
        assert_eq!(entity.payload, json!({"title": "Plates"}));
        let base = entity.base.as_ref().unwrap();
        assert_eq!(base.version, 1);
        assert_eq!(base.payload, json!({"title": "Dishes"}));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut entity =
            Entity::from_server("tasks", "t-1", json!({"title": "Dishes"}), 4, 1000, false);
        entity.edit(json!({"title": "Plates"}), 2000);

        let json = serde_json::to_string(&entity).unwrap();
        assert!(json.contains("entityType")); // camelCase
        let parsed: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(entity, parsed);
    }
}
