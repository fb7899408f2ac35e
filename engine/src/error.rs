//! Error types for the Tandem engine.

use crate::{EntityId, EntityType, MutationId, Version};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(EntityType),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Queue errors
    #[error("mutation not found: {0}")]
    MutationNotFound(MutationId),

    #[error("lane not found: {entity_type}/{entity_id}")]
    LaneNotFound {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    #[error("lane already has a mutation in flight: {entity_type}/{entity_id}")]
    LaneBusy {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: MutationId,
        from: &'static str,
        to: &'static str,
    },

    // Resolution errors
    #[error("conflict base version mismatch: expected {expected}, got {actual}")]
    BaseVersionMismatch { expected: Version, actual: Version },

    #[error("conflict has no data on either side")]
    EmptyConflict,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
