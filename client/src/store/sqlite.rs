//! The encrypted SQLite-backed local store.
//!
//! Holds entity snapshots, the durable mutation queue, the pull cursor,
//! and the conflict audit trail. All payloads are sealed with the
//! [`Cipher`](super::crypto::Cipher) before they touch disk; sync metadata
//! (versions, flags, timestamps) stays queryable in the clear.
//!
//! Multi-row changes that must land together (applying a pull page and its
//! cursor, acknowledging a push) go through a single transaction so a
//! crash can never leave the store observing half a sync step.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tandem_engine::{
    BaseState, ConflictRecord, Cursor, Entity, EntityId, EntityType, Mutation, MutationKind,
    MutationStatus, Strategy,
};

use super::crypto::{Cipher, KeyProvider};
use crate::error::{Error, Result};
use crate::store::schema;

/// A set of changes applied atomically at a sync step boundary.
///
/// Built up by the orchestrator while processing a pull page or a push
/// outcome, then committed in one transaction via [`LocalStore::commit`].
#[derive(Debug, Default)]
pub struct SyncCommit {
    /// Entity snapshots to write (insert or overwrite)
    pub upserts: Vec<Entity>,
    /// Entity rows to remove outright (server-confirmed deletes)
    pub purges: Vec<(EntityType, EntityId)>,
    /// Conflict audit records to append
    pub conflicts: Vec<ConflictRecord>,
    /// Lanes whose queued mutation rows are dropped (resolution superseded them)
    pub drop_lanes: Vec<(EntityType, EntityId)>,
    /// Re-based replacement mutations to enqueue
    pub enqueues: Vec<Mutation>,
    /// Queued mutations whose base version moved (the lane ahead of them
    /// was acknowledged); only `base_version` is rewritten on the row
    pub rebases: Vec<Mutation>,
    /// Acknowledged mutation rows to delete
    pub acks: Vec<String>,
    /// New cursor position, if this commit completes a pull page
    pub cursor: Option<Cursor>,
}

impl SyncCommit {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.purges.is_empty()
            && self.conflicts.is_empty()
            && self.drop_lanes.is_empty()
            && self.enqueues.is_empty()
            && self.rebases.is_empty()
            && self.acks.is_empty()
            && self.cursor.is_none()
    }
}

/// Encrypted local persistence for one device.
pub struct LocalStore {
    pool: SqlitePool,
    cipher: Cipher,
}

impl LocalStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path, keys: &dyn KeyProvider) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect(options, keys).await
    }

    /// Open a private in-memory database. Used in tests.
    pub async fn open_in_memory(keys: &dyn KeyProvider) -> Result<Self> {
        Self::connect(SqliteConnectOptions::new().in_memory(true), keys).await
    }

    async fn connect(options: SqliteConnectOptions, keys: &dyn KeyProvider) -> Result<Self> {
        // A single connection keeps transactions strictly serialized and
        // keeps in-memory databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in schema::ALL {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            cipher: Cipher::new(keys)?,
        })
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Read an active entity. Tombstoned entities read as absent.
    pub async fn read(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        Ok(self
            .read_any(entity_type, id)
            .await?
            .filter(Entity::is_active))
    }

    /// Read an entity including tombstones. The sync cycle needs to see
    /// pending deletes that callers should not.
    pub async fn read_any(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT entity_type, id, version, updated_at, dirty, deleted, payload,
                    base_version, base_payload
             FROM entities WHERE entity_type = ? AND id = ?",
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_entity(&r)).transpose()
    }

    /// All active entities of one type, for application reads.
    pub async fn list(&self, entity_type: &str) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            "SELECT entity_type, id, version, updated_at, dirty, deleted, payload,
                    base_version, base_payload
             FROM entities WHERE entity_type = ? AND deleted = 0
             ORDER BY id",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_entity(r)).collect()
    }

    /// Write an entity snapshot outside a sync step.
    pub async fn write_entity(&self, entity: &Entity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.upsert_entity_tx(&mut tx, entity).await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local writes (entity + mutation staged together)
    // ------------------------------------------------------------------

    /// Persist a local edit and its queued mutation in one transaction, so
    /// the entity can never be dirty without a mutation recording why, nor
    /// the reverse.
    pub async fn stage(&self, entity: &Entity, mutation: &Mutation) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.upsert_entity_tx(&mut tx, entity).await?;
        self.insert_mutation_tx(&mut tx, mutation).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a never-synced entity and its whole lane. Used when a delete
    /// compacts away an unsynced create: the server never heard of the
    /// entity, so nothing remains to tell it.
    pub async fn compact_lane(&self, entity_type: &str, entity_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mutations WHERE entity_type = ? AND entity_id = ?")
            .bind(entity_type)
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM entities WHERE entity_type = ? AND id = ?")
            .bind(entity_type)
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation queue rows
    // ------------------------------------------------------------------

    /// Load the queue for restore, in enqueue order.
    ///
    /// Mutations that were in flight when the process died are normalized
    /// back to pending - the push may or may not have reached the server,
    /// and the idempotency key makes redelivery safe. Backoff deadlines do
    /// not survive a restart either; a fresh process retries immediately.
    pub async fn load_queue(&self) -> Result<Vec<Mutation>> {
        sqlx::query(
            "UPDATE mutations SET status = 'pending', not_before = NULL
             WHERE status = 'inFlight'",
        )
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, kind, payload, base_version,
                    client_timestamp, attempt, status, not_before
             FROM mutations
             WHERE status IN ('pending', 'conflict')
             ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_mutation(r)).collect()
    }

    /// Mirror an in-memory status change (attempt, status, backoff) to the
    /// row.
    pub async fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        sqlx::query(
            "UPDATE mutations SET status = ?, attempt = ?, not_before = ? WHERE id = ?",
        )
        .bind(status_str(mutation.status))
        .bind(mutation.attempt as i64)
        .bind(mutation.not_before.map(|t| t as i64))
        .bind(&mutation.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminally failed mutations still on disk, for surfacing after a
    /// restart.
    pub async fn failed_mutations(&self) -> Result<Vec<Mutation>> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, kind, payload, base_version,
                    client_timestamp, attempt, status, not_before
             FROM mutations WHERE status = 'failedTerminal' ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_mutation(r)).collect()
    }

    // ------------------------------------------------------------------
    // Sync step commits
    // ------------------------------------------------------------------

    /// Apply a [`SyncCommit`] atomically.
    pub async fn commit(&self, commit: &SyncCommit) -> Result<()> {
        if commit.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for entity in &commit.upserts {
            self.upsert_entity_tx(&mut tx, entity).await?;
        }
        for (entity_type, id) in &commit.purges {
            sqlx::query("DELETE FROM entities WHERE entity_type = ? AND id = ?")
                .bind(entity_type)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for (entity_type, entity_id) in &commit.drop_lanes {
            sqlx::query("DELETE FROM mutations WHERE entity_type = ? AND entity_id = ?")
                .bind(entity_type)
                .bind(entity_id)
                .execute(&mut *tx)
                .await?;
        }
        for mutation in &commit.enqueues {
            self.insert_mutation_tx(&mut tx, mutation).await?;
        }
        for mutation in &commit.rebases {
            sqlx::query("UPDATE mutations SET base_version = ? WHERE id = ?")
                .bind(mutation.base_version as i64)
                .bind(&mutation.id)
                .execute(&mut *tx)
                .await?;
        }
        for id in &commit.acks {
            sqlx::query("DELETE FROM mutations WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for record in &commit.conflicts {
            self.insert_conflict_tx(&mut tx, record).await?;
        }
        if let Some(cursor) = &commit.cursor {
            sqlx::query(
                "INSERT INTO sync_cursor (id, token) VALUES (0, ?)
                 ON CONFLICT (id) DO UPDATE SET token = excluded.token",
            )
            .bind(cursor.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// The persisted pull cursor, or the start cursor if none yet.
    pub async fn cursor(&self) -> Result<Cursor> {
        let row = sqlx::query("SELECT token FROM sync_cursor WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Cursor::from(r.try_get::<String, _>("token")?),
            None => Cursor::start(),
        })
    }

    // ------------------------------------------------------------------
    // Conflict records
    // ------------------------------------------------------------------

    /// Conflicts awaiting a user decision.
    pub async fn pending_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, client_version, server_version,
                    client_data, server_data, detected_at, strategy, resolved
             FROM conflicts WHERE resolved = 0 ORDER BY detected_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_conflict(r)).collect()
    }

    /// The full conflict audit trail, resolved and pending alike.
    pub async fn all_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, client_version, server_version,
                    client_data, server_data, detected_at, strategy, resolved
             FROM conflicts ORDER BY detected_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_conflict(r)).collect()
    }

    /// Look up a single conflict record.
    pub async fn conflict(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let row = sqlx::query(
            "SELECT id, entity_type, entity_id, client_version, server_version,
                    client_data, server_data, detected_at, strategy, resolved
             FROM conflicts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_conflict(&r)).transpose()
    }

    /// Mark a conflict resolved, recording the strategy that settled it.
    pub async fn resolve_conflict(&self, id: &str, strategy: Strategy) -> Result<()> {
        sqlx::query("UPDATE conflicts SET resolved = 1, strategy = ? WHERE id = ?")
            .bind(strategy_str(strategy))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row plumbing
    // ------------------------------------------------------------------

    async fn upsert_entity_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entity: &Entity,
    ) -> Result<()> {
        let payload = self.cipher.seal_json(&entity.payload)?;
        let base_payload = entity
            .base
            .as_ref()
            .map(|b| self.cipher.seal_json(&b.payload))
            .transpose()?;

        sqlx::query(
            "INSERT INTO entities
                 (entity_type, id, version, updated_at, dirty, deleted, payload,
                  base_version, base_payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (entity_type, id) DO UPDATE SET
                 version = excluded.version,
                 updated_at = excluded.updated_at,
                 dirty = excluded.dirty,
                 deleted = excluded.deleted,
                 payload = excluded.payload,
                 base_version = excluded.base_version,
                 base_payload = excluded.base_payload",
        )
        .bind(&entity.entity_type)
        .bind(&entity.id)
        .bind(entity.version as i64)
        .bind(entity.updated_at as i64)
        .bind(entity.dirty as i64)
        .bind(entity.deleted as i64)
        .bind(payload)
        .bind(entity.base.as_ref().map(|b| b.version as i64))
        .bind(base_payload)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_mutation_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        mutation: &Mutation,
    ) -> Result<()> {
        let payload = mutation
            .payload
            .as_ref()
            .map(|p| self.cipher.seal_json(p))
            .transpose()?;

        sqlx::query(
            "INSERT INTO mutations
                 (id, entity_type, entity_id, kind, payload, base_version,
                  client_timestamp, attempt, status, not_before)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&mutation.id)
        .bind(&mutation.entity_type)
        .bind(&mutation.entity_id)
        .bind(kind_str(mutation.kind))
        .bind(payload)
        .bind(mutation.base_version as i64)
        .bind(mutation.client_timestamp as i64)
        .bind(mutation.attempt as i64)
        .bind(status_str(mutation.status))
        .bind(mutation.not_before.map(|t| t as i64))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_conflict_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        record: &ConflictRecord,
    ) -> Result<()> {
        let client_data = record
            .client_data
            .as_ref()
            .map(|v| self.cipher.seal_json(v))
            .transpose()?;
        let server_data = record
            .server_data
            .as_ref()
            .map(|v| self.cipher.seal_json(v))
            .transpose()?;

        sqlx::query(
            "INSERT INTO conflicts
                 (id, entity_type, entity_id, client_version, server_version,
                  client_data, server_data, detected_at, strategy, resolved)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(record.client_version as i64)
        .bind(record.server_version as i64)
        .bind(client_data)
        .bind(server_data)
        .bind(record.detected_at as i64)
        .bind(record.strategy_applied.map(strategy_str))
        .bind(record.resolved as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn row_to_entity(&self, row: &SqliteRow) -> Result<Entity> {
        let payload = self.cipher.open_json(&row.try_get::<Vec<u8>, _>("payload")?)?;
        let base_version: Option<i64> = row.try_get("base_version")?;
        let base_payload: Option<Vec<u8>> = row.try_get("base_payload")?;
        let base = match (base_version, base_payload) {
            (Some(version), Some(blob)) => Some(BaseState {
                version: version as u64,
                payload: self.cipher.open_json(&blob)?,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Corrupt(
                    "entity row has a half-present base state".into(),
                ))
            }
        };

        Ok(Entity {
            entity_type: row.try_get("entity_type")?,
            id: row.try_get("id")?,
            version: row.try_get::<i64, _>("version")? as u64,
            updated_at: row.try_get::<i64, _>("updated_at")? as u64,
            dirty: row.try_get::<i64, _>("dirty")? != 0,
            deleted: row.try_get::<i64, _>("deleted")? != 0,
            payload,
            base,
        })
    }

    fn row_to_mutation(&self, row: &SqliteRow) -> Result<Mutation> {
        let payload = row
            .try_get::<Option<Vec<u8>>, _>("payload")?
            .map(|blob| self.cipher.open_json(&blob))
            .transpose()?;

        Ok(Mutation {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            kind: kind_from_str(&row.try_get::<String, _>("kind")?)?,
            payload,
            base_version: row.try_get::<i64, _>("base_version")? as u64,
            client_timestamp: row.try_get::<i64, _>("client_timestamp")? as u64,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            status: status_from_str(&row.try_get::<String, _>("status")?)?,
            not_before: row.try_get::<Option<i64>, _>("not_before")?.map(|t| t as u64),
        })
    }

    fn row_to_conflict(&self, row: &SqliteRow) -> Result<ConflictRecord> {
        let client_data = row
            .try_get::<Option<Vec<u8>>, _>("client_data")?
            .map(|blob| self.cipher.open_json(&blob))
            .transpose()?;
        let server_data = row
            .try_get::<Option<Vec<u8>>, _>("server_data")?
            .map(|blob| self.cipher.open_json(&blob))
            .transpose()?;

        Ok(ConflictRecord {
            id: row.try_get("id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            client_version: row.try_get::<i64, _>("client_version")? as u64,
            server_version: row.try_get::<i64, _>("server_version")? as u64,
            client_data,
            server_data,
            detected_at: row.try_get::<i64, _>("detected_at")? as u64,
            strategy_applied: row
                .try_get::<Option<String>, _>("strategy")?
                .map(|s| strategy_from_str(&s))
                .transpose()?,
            resolved: row.try_get::<i64, _>("resolved")? != 0,
        })
    }
}

fn kind_str(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Create => "create",
        MutationKind::Update => "update",
        MutationKind::Delete => "delete",
    }
}

fn kind_from_str(s: &str) -> Result<MutationKind> {
    match s {
        "create" => Ok(MutationKind::Create),
        "update" => Ok(MutationKind::Update),
        "delete" => Ok(MutationKind::Delete),
        other => Err(Error::Corrupt(format!("unknown mutation kind {other:?}"))),
    }
}

fn status_str(status: MutationStatus) -> &'static str {
    match status {
        MutationStatus::Pending => "pending",
        MutationStatus::InFlight => "inFlight",
        MutationStatus::Acked => "acked",
        MutationStatus::Conflict => "conflict",
        MutationStatus::FailedTerminal => "failedTerminal",
    }
}

fn status_from_str(s: &str) -> Result<MutationStatus> {
    match s {
        "pending" => Ok(MutationStatus::Pending),
        "inFlight" => Ok(MutationStatus::InFlight),
        "acked" => Ok(MutationStatus::Acked),
        "conflict" => Ok(MutationStatus::Conflict),
        "failedTerminal" => Ok(MutationStatus::FailedTerminal),
        other => Err(Error::Corrupt(format!("unknown mutation status {other:?}"))),
    }
}

fn strategy_str(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Tombstone => "tombstone",
        Strategy::Completion => "completion",
        Strategy::FieldMerge => "fieldMerge",
        Strategy::LastWriterWins => "lastWriterWins",
        Strategy::ManualReview => "manualReview",
    }
}

fn strategy_from_str(s: &str) -> Result<Strategy> {
    match s {
        "tombstone" => Ok(Strategy::Tombstone),
        "completion" => Ok(Strategy::Completion),
        "fieldMerge" => Ok(Strategy::FieldMerge),
        "lastWriterWins" => Ok(Strategy::LastWriterWins),
        "manualReview" => Ok(Strategy::ManualReview),
        other => Err(Error::Corrupt(format!("unknown strategy {other:?}"))),
    }
}
