//! # Tandem Engine
//!
//! The deterministic core of Tandem's offline-first synchronization.
//!
//! This crate contains the pure logic of the sync subsystem: entity
//! snapshots, the per-lane mutation queue, conflict detection and
//! resolution. It has no knowledge of files, databases, the network, or
//! wall clocks - the same inputs always produce the same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the outside world
//! - **Deterministic**: timestamps and jitter samples are supplied by the caller
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! Local state is stored as [`Entity`] snapshots with:
//! - Entity type and unique ID
//! - Server-assigned version (only advances on server acknowledgment)
//! - JSON payload (opaque to the engine, validated at the boundary)
//! - Dirty flag and soft-delete flag (tombstone)
//! - The last server-acknowledged base state, retained while dirty
//!
//! ### Mutations and Lanes
//!
//! Local changes are expressed as [`Mutation`]s carrying an idempotency key,
//! a base version, and a status state machine. Mutations for the same
//! `(entity_type, entity_id)` form a *lane* inside [`MutationQueue`] and are
//! never reordered relative to each other; at most one mutation per lane is
//! in flight at any time.
//!
//! ### Conflict Detection and Resolution
//!
//! [`detect::classify`] decides, for each incoming server snapshot, whether
//! it is a clean overwrite or a real conflict. Conflicts go through
//! [`Resolver`], which applies strategies in a fixed precedence order:
//! tombstone wins, completion wins, field-level merge of disjoint edits,
//! last-writer-wins, and finally manual review. Every detected conflict
//! produces a [`ConflictRecord`], even when resolved automatically.

pub mod detect;
pub mod entity;
pub mod error;
pub mod mutation;
pub mod queue;
pub mod resolve;
pub mod schema;
pub mod session;

// Re-export main types at crate root
pub use detect::{classify, PullClass, ServerEntity};
pub use entity::{BaseState, Entity};
pub use error::Error;
pub use mutation::{Mutation, MutationKind, MutationStatus};
pub use queue::{EnqueueOutcome, FailureDisposition, LaneKey, MutationQueue, RetryPolicy};
pub use resolve::{ConflictRecord, ConflictSides, Resolution, ResolvedState, Resolver, Strategy};
pub use schema::{FieldDef, FieldType, SyncSchema, TypePolicy};
pub use session::{Cursor, SyncSession};

/// Type aliases for clarity
pub type EntityType = String;
pub type EntityId = String;
pub type MutationId = String;
pub type ConflictId = String;
pub type DeviceId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
