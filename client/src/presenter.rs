//! Manual conflict review.
//!
//! Most conflicts resolve automatically; the ones flagged for manual
//! review park their lane and wait here. The presentation layer
//! implements [`ConflictPresenter`] to hear about new pending conflicts
//! and calls back through [`ConflictInbox`] with the user's decision.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tandem_engine::{BaseState, ConflictRecord, Mutation, Strategy};
use uuid::Uuid;

use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::store::SyncCommit;
use crate::wall_now_ms;

/// Implemented by the presentation layer (settings screen, review sheet).
#[async_trait]
pub trait ConflictPresenter: Send + Sync {
    /// Called after a sync step records conflicts that need a decision.
    async fn review_requested(&self, records: &[ConflictRecord]);
}

/// Handle for listing pending conflicts and settling them.
pub struct ConflictInbox {
    inner: Arc<EngineInner>,
}

impl ConflictInbox {
    pub(crate) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Conflicts awaiting a decision, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<ConflictRecord>> {
        self.inner.store.pending_conflicts().await
    }

    /// The full audit trail, including auto-resolved conflicts.
    pub async fn history(&self) -> Result<Vec<ConflictRecord>> {
        self.inner.store.all_conflicts().await
    }

    /// Settle a conflict with the user's chosen state.
    ///
    /// `None` accepts the server's state and discards the local change.
    /// `Some(payload)` keeps that payload: if it matches the server's
    /// state the entity simply goes clean, otherwise it is re-based on
    /// the server's version and re-enqueued for push. Either way the held
    /// lane is released. Settling an already-resolved conflict is a no-op.
    pub async fn resolve(&self, conflict_id: &str, chosen: Option<Value>) -> Result<()> {
        let record = self
            .inner
            .store
            .conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;
        if record.resolved {
            return Ok(());
        }

        if let Some(payload) = &chosen {
            self.inner
                .schema
                .policy(&record.entity_type)?
                .validate_payload(payload)?;
        }

        let mut queue = self.inner.queue.lock().await;
        let local = self
            .inner
            .store
            .read_any(&record.entity_type, &record.entity_id)
            .await?
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "pending conflict for missing entity {}/{}",
                    record.entity_type, record.entity_id
                ))
            })?;

        let now = wall_now_ms();
        let key = (record.entity_type.clone(), record.entity_id.clone());
        let mut commit = SyncCommit::default();
        commit.drop_lanes.push(key.clone());

        let keeps_local = match (&chosen, &record.server_data) {
            (Some(payload), Some(server)) => payload != server,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if keeps_local {
            // chosen is Some here by construction of keeps_local
            let Some(payload) = chosen else {
                return Err(Error::Corrupt("chosen payload vanished".into()));
            };
            let mut entity = local;
            entity.payload = payload.clone();
            entity.deleted = false;
            entity.dirty = true;
            entity.updated_at = now;
            entity.base = record.server_data.clone().map(|server| BaseState {
                version: record.server_version,
                payload: server,
            });
            commit.upserts.push(entity);
            commit.enqueues.push(Mutation::update(
                Uuid::new_v4().to_string(),
                record.entity_type.clone(),
                record.entity_id.clone(),
                payload,
                record.server_version,
                now,
            ));
        } else {
            match &record.server_data {
                Some(server) => {
                    let mut entity = local;
                    entity.absorb_server(server.clone(), record.server_version, now, false);
                    commit.upserts.push(entity);
                }
                None => commit.purges.push(key.clone()),
            }
        }

        self.inner.store.commit(&commit).await?;
        for (entity_type, entity_id) in &commit.drop_lanes {
            queue.take_lane(entity_type, entity_id);
        }
        for mutation in &commit.enqueues {
            queue.enqueue(mutation.clone());
        }
        drop(queue);

        self.inner
            .store
            .resolve_conflict(conflict_id, Strategy::ManualReview)
            .await?;
        tracing::info!(
            conflict = conflict_id,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            kept_local = keeps_local,
            "manual conflict settled"
        );
        Ok(())
    }
}
