//! The sync orchestrator.
//!
//! [`SyncEngine`] owns the full cycle: pull server deltas page by page,
//! classify and resolve them against local state, then drain the mutation
//! queue lane by lane. Each pull page and each push acknowledgment commits
//! atomically together with the metadata it implies (cursor, queue rows),
//! so a crash at any point resumes cleanly - at worst a mutation is
//! redelivered, which its idempotency key makes harmless.
//!
//! `sync()` is single-flight: a call while a cycle is already running
//! joins the in-progress cycle and returns its outcome rather than
//! starting another.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tandem_engine::{
    classify, BaseState, ConflictRecord, ConflictSides, Entity, EnqueueOutcome,
    FailureDisposition, Mutation, MutationQueue, MutationStatus, PullClass, Resolution,
    ResolvedState, Resolver, SyncSchema, SyncSession,
};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::presenter::{ConflictInbox, ConflictPresenter};
use crate::store::{LocalStore, SyncCommit};
use crate::transport::{PullPage, PushOutcome, SyncTransport};
use crate::{wall_now_ms, SyncContext};

/// What a completed cycle did.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Counters for the cycle
    pub session: SyncSession,
    /// Mutations that exhausted their attempts or were permanently
    /// rejected during this cycle
    pub terminal_failures: Vec<Mutation>,
    /// Conflicts still awaiting a user decision after the cycle
    pub manual_conflicts: u64,
}

/// Outcome shared with joiners of an in-progress cycle. Errors cross the
/// channel as strings because [`Error`] is not cloneable.
type CycleOutcome = std::result::Result<SyncReport, String>;

pub(crate) struct EngineInner {
    pub(crate) store: LocalStore,
    pub(crate) transport: Arc<dyn SyncTransport>,
    pub(crate) schema: SyncSchema,
    pub(crate) config: Config,
    pub(crate) context: SyncContext,
    pub(crate) queue: Mutex<MutationQueue>,
    pub(crate) presenter: std::sync::Mutex<Option<Arc<dyn ConflictPresenter>>>,
    inflight: Mutex<Option<watch::Receiver<Option<CycleOutcome>>>>,
    cancel: watch::Sender<bool>,
    /// Monotonic origin for backoff scheduling. Queue deadlines are
    /// expressed as milliseconds since this instant, not wall time, so
    /// they survive clock jumps.
    epoch: tokio::time::Instant,
}

/// Device-side sync orchestrator.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build an engine over an opened store, restoring the durable queue.
    pub async fn new(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        schema: SyncSchema,
        config: Config,
        context: SyncContext,
    ) -> Result<Self> {
        let queue = MutationQueue::restore(store.load_queue().await?);
        tracing::info!(
            device = %context.device_id,
            restored = queue.len(),
            "sync engine ready"
        );
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                schema,
                config,
                context,
                queue: Mutex::new(queue),
                presenter: std::sync::Mutex::new(None),
                inflight: Mutex::new(None),
                cancel,
                epoch: tokio::time::Instant::now(),
            }),
        })
    }

    /// Register the presentation layer that reviews manual conflicts.
    pub fn set_presenter(&self, presenter: Arc<dyn ConflictPresenter>) {
        if let Ok(mut slot) = self.inner.presenter.lock() {
            *slot = Some(presenter);
        }
    }

    /// Handle for listing and settling manual conflicts.
    pub fn inbox(&self) -> ConflictInbox {
        ConflictInbox::new(Arc::clone(&self.inner))
    }

    /// Terminally failed mutations persisted from earlier runs.
    pub async fn failed_mutations(&self) -> Result<Vec<Mutation>> {
        self.inner.store.failed_mutations().await
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Local reads and writes
    // ------------------------------------------------------------------

    /// Read an active entity.
    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        self.inner.store.read(entity_type, id).await
    }

    /// All active entities of one type.
    pub async fn list(&self, entity_type: &str) -> Result<Vec<Entity>> {
        self.inner.store.list(entity_type).await
    }

    /// Create a new entity with a generated ID.
    pub async fn create(&self, entity_type: &str, payload: Value) -> Result<Entity> {
        let id = Uuid::new_v4().to_string();
        self.put(entity_type, &id, payload).await
    }

    /// Create or update an entity. The edit is persisted together with
    /// its queued mutation; it reaches the server on the next cycle.
    pub async fn put(&self, entity_type: &str, id: &str, payload: Value) -> Result<Entity> {
        self.inner
            .schema
            .policy(entity_type)?
            .validate_payload(&payload)?;

        let now = wall_now_ms();
        let mut queue = self.inner.queue.lock().await;
        let existing = self.inner.store.read_any(entity_type, id).await?;

        let (entity, mutation) = match existing {
            Some(mut entity) if entity.is_active() => {
                entity.edit(payload.clone(), now);
                let mutation = Mutation::update(
                    Uuid::new_v4().to_string(),
                    entity_type,
                    id,
                    payload,
                    entity.base_version(),
                    now,
                );
                (entity, mutation)
            }
            Some(_) => {
                // Tombstoned locally; the ID is unusable until the server
                // confirms the delete and the row is purged.
                return Err(Error::EntityNotFound {
                    entity_type: entity_type.to_string(),
                    entity_id: id.to_string(),
                });
            }
            None => {
                let entity = Entity::new_local(entity_type, id, payload.clone(), now);
                let mutation =
                    Mutation::create(Uuid::new_v4().to_string(), entity_type, id, payload, now);
                (entity, mutation)
            }
        };

        queue.enqueue(mutation.clone());
        self.inner.store.stage(&entity, &mutation).await?;
        tracing::debug!(entity_type, id, kind = ?mutation.kind, "staged local write");
        Ok(entity)
    }

    /// Delete an entity. The tombstone is retained until the server
    /// confirms; deleting a never-synced entity erases it outright.
    pub async fn remove(&self, entity_type: &str, id: &str) -> Result<()> {
        let now = wall_now_ms();
        let mut queue = self.inner.queue.lock().await;
        let mut entity = self.inner.store.read_any(entity_type, id).await?.ok_or(
            Error::EntityNotFound {
                entity_type: entity_type.to_string(),
                entity_id: id.to_string(),
            },
        )?;
        if entity.deleted {
            return Ok(());
        }

        entity.tombstone(now);
        let mutation = Mutation::delete(
            Uuid::new_v4().to_string(),
            entity_type,
            id,
            entity.base_version(),
            now,
        );
        match queue.enqueue(mutation.clone()) {
            EnqueueOutcome::CompactedAway => {
                self.inner.store.compact_lane(entity_type, id).await?;
                tracing::debug!(entity_type, id, "delete compacted an unsynced create");
            }
            EnqueueOutcome::Queued => {
                self.inner.store.stage(&entity, &mutation).await?;
                tracing::debug!(entity_type, id, "staged delete");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // The sync cycle
    // ------------------------------------------------------------------

    /// Run a sync cycle, or join the one already running.
    pub async fn sync(&self) -> Result<SyncReport> {
        let (leader, mut follower) = {
            let mut slot = self.inner.inflight.lock().await;
            match slot.as_ref() {
                Some(rx) => (None, rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None::<CycleOutcome>);
                    *slot = Some(rx.clone());
                    (Some(tx), rx)
                }
            }
        };

        match leader {
            Some(tx) => {
                let result = self.run_cycle().await;
                let shared = match &result {
                    Ok(report) => Ok(report.clone()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(Some(shared));
                *self.inner.inflight.lock().await = None;
                result
            }
            None => loop {
                {
                    let value = follower.borrow_and_update();
                    if let Some(outcome) = value.clone() {
                        return outcome.map_err(Error::CycleFailed);
                    }
                }
                if follower.changed().await.is_err() {
                    return Err(Error::Cancelled);
                }
            },
        }
    }

    /// Abort the in-progress cycle at the next step boundary. Everything
    /// already committed stays committed.
    pub fn cancel(&self) {
        let _ = self.inner.cancel.send(true);
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        self.inner.cancel.send_replace(false);
        let mut session = SyncSession::start(wall_now_ms());
        let mut terminal = Vec::new();

        tracing::debug!(device = %self.inner.context.device_id, "sync cycle starting");
        self.pull_phase(&mut session).await?;
        let push_result = self.push_phase(&mut session, &mut terminal).await;
        if push_result.is_err() {
            // An aborted push leaves lane heads in flight; return them to
            // pending so the next cycle can dispatch them again.
            self.recover_in_flight().await;
        }
        push_result?;
        let manual_conflicts = self.inner.store.pending_conflicts().await?.len() as u64;

        tracing::info!(
            pulled = session.pulled,
            pushed = session.pushed,
            conflicts = session.conflicts_found,
            errors = session.errors,
            manual = manual_conflicts,
            "sync cycle complete"
        );
        Ok(SyncReport {
            session,
            terminal_failures: terminal,
            manual_conflicts,
        })
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    async fn pull_phase(&self, session: &mut SyncSession) -> Result<()> {
        let mut cursor = self.inner.store.cursor().await?;
        loop {
            self.check_cancel()?;
            let pull = self.inner.transport.pull(&cursor, self.inner.config.pull_limit);
            let page = match tokio::time::timeout(self.inner.config.request_timeout, pull).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(self.inner.config.request_timeout)),
            };
            tracing::debug!(entities = page.entities.len(), cursor = %cursor, "pull page");
            self.apply_page(&page, session).await?;
            cursor = page.next_cursor.clone();
            if !page.has_more {
                return Ok(());
            }
        }
    }

    /// Classify and resolve one pull page, committing its effects and the
    /// advanced cursor in a single transaction.
    async fn apply_page(&self, page: &PullPage, session: &mut SyncSession) -> Result<()> {
        let resolver = Resolver::new(&self.inner.schema);
        let mut commit = SyncCommit {
            cursor: Some(page.next_cursor.clone()),
            ..SyncCommit::default()
        };
        let mut held_lanes: Vec<(String, String)> = Vec::new();
        let mut manual_records: Vec<ConflictRecord> = Vec::new();

        let mut queue = self.inner.queue.lock().await;

        for incoming in &page.entities {
            let local = self
                .inner
                .store
                .read_any(&incoming.entity_type, &incoming.id)
                .await?;

            match classify(incoming, local.as_ref()) {
                PullClass::Ignore => {}
                PullClass::Apply => {
                    session.pulled += 1;
                    if incoming.deleted {
                        if local.is_some() {
                            commit
                                .purges
                                .push((incoming.entity_type.clone(), incoming.id.clone()));
                        }
                    } else {
                        let entity = match local {
                            Some(mut entity) => {
                                entity.absorb_server(
                                    incoming.payload.clone(),
                                    incoming.version,
                                    incoming.updated_at,
                                    incoming.deleted,
                                );
                                entity
                            }
                            None => Entity::from_server(
                                incoming.entity_type.clone(),
                                incoming.id.clone(),
                                incoming.payload.clone(),
                                incoming.version,
                                incoming.updated_at,
                                incoming.deleted,
                            ),
                        };
                        commit.upserts.push(entity);
                    }
                }
                PullClass::Conflict => {
                    let Some(local) = local else { continue };
                    session.pulled += 1;
                    session.conflicts_found += 1;

                    let sides = ConflictSides {
                        entity_type: incoming.entity_type.clone(),
                        entity_id: incoming.id.clone(),
                        base_version: local.base_version(),
                        base_payload: local.base.as_ref().map(|b| b.payload.clone()),
                        client_payload: if local.deleted {
                            None
                        } else {
                            Some(local.payload.clone())
                        },
                        client_timestamp: local.updated_at,
                        server_payload: if incoming.deleted {
                            None
                        } else {
                            Some(incoming.payload.clone())
                        },
                        server_version: incoming.version,
                        server_updated_at: incoming.updated_at,
                    };
                    let resolution = resolver.resolve(&sides)?;
                    let record = ConflictRecord::new(
                        Uuid::new_v4().to_string(),
                        &sides,
                        wall_now_ms(),
                        &resolution,
                    );
                    tracing::info!(
                        entity_type = %sides.entity_type,
                        entity_id = %sides.entity_id,
                        resolution = ?resolution,
                        "conflict detected on pull"
                    );
                    match &resolution {
                        Resolution::Auto { state, .. } => {
                            plan_resolution(&local, &sides, state, &mut commit);
                        }
                        Resolution::Manual => {
                            held_lanes
                                .push((incoming.entity_type.clone(), incoming.id.clone()));
                            manual_records.push(record.clone());
                        }
                    }
                    commit.conflicts.push(record);
                }
            }
        }

        self.inner.store.commit(&commit).await?;

        // Mirror the committed queue changes in memory.
        for (entity_type, entity_id) in &commit.drop_lanes {
            queue.take_lane(entity_type, entity_id);
        }
        for mutation in &commit.enqueues {
            queue.enqueue(mutation.clone());
        }
        for (entity_type, entity_id) in &held_lanes {
            queue.hold_lane(entity_type, entity_id);
        }
        drop(queue);

        self.notify_presenter(&manual_records).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    async fn push_phase(
        &self,
        session: &mut SyncSession,
        terminal: &mut Vec<Mutation>,
    ) -> Result<()> {
        loop {
            self.check_cancel()?;
            let now = self.mono_now();
            let batch = {
                let queue = self.inner.queue.lock().await;
                queue.next_batch(self.inner.config.push_batch_limit, now)
            };

            if batch.is_empty() {
                let next = {
                    let queue = self.inner.queue.lock().await;
                    queue.next_not_before(now)
                };
                match next {
                    Some(at) => {
                        self.backoff_sleep(at.saturating_sub(now)).await?;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            // Mark the batch in flight, in memory and on disk, before any
            // bytes leave the device.
            let mut dispatched = Vec::with_capacity(batch.len());
            {
                let mut queue = self.inner.queue.lock().await;
                for mut mutation in batch {
                    queue.mark_in_flight(&mutation.id)?;
                    mutation.transition(MutationStatus::InFlight)?;
                    mutation.attempt += 1;
                    mutation.not_before = None;
                    dispatched.push(mutation);
                }
            }
            for mutation in &dispatched {
                self.inner.store.update_mutation(mutation).await?;
            }

            // Each chunk holds distinct lanes (a batch carries at most one
            // mutation per lane), so chunks can fly concurrently without
            // reordering any entity's history.
            let concurrency = self.inner.config.push_concurrency;
            let chunk_size = (dispatched.len() + concurrency - 1) / concurrency;
            let timeout = self.inner.config.request_timeout;
            let chunks: Vec<Vec<Mutation>> = dispatched
                .chunks(chunk_size.max(1))
                .map(|chunk| chunk.to_vec())
                .collect();
            let results: Vec<(Vec<Mutation>, Result<Vec<PushOutcome>>)> =
                futures::stream::iter(chunks.into_iter().map(|chunk| {
                    let transport = Arc::clone(&self.inner.transport);
                    async move {
                        let result =
                            match tokio::time::timeout(timeout, transport.push(&chunk)).await {
                                Ok(result) => result,
                                Err(_) => Err(Error::Timeout(timeout)),
                            };
                        (chunk, result)
                    }
                }))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for (chunk, result) in results {
                match result {
                    Ok(outcomes) => {
                        for outcome in outcomes {
                            self.handle_outcome(&chunk, outcome, session, terminal)
                                .await?;
                        }
                    }
                    Err(error) if error.is_transient() => {
                        session.errors += 1;
                        tracing::warn!(%error, mutations = chunk.len(), "push request failed");
                        for mutation in &chunk {
                            self.note_transient_failure(mutation, terminal).await?;
                        }
                    }
                    Err(error) => return Err(error),
                }
            }
        }
    }

    async fn handle_outcome(
        &self,
        chunk: &[Mutation],
        outcome: PushOutcome,
        session: &mut SyncSession,
        terminal: &mut Vec<Mutation>,
    ) -> Result<()> {
        let Some(mutation) = chunk.iter().find(|m| m.id == outcome.mutation_id()) else {
            return Err(Error::Corrupt(format!(
                "push outcome for unknown mutation {}",
                outcome.mutation_id()
            )));
        };

        match outcome {
            PushOutcome::Acked {
                id,
                version,
                updated_at,
            } => {
                let mut queue = self.inner.queue.lock().await;
                let acked = queue.mark_acked(&id)?;
                let lane_empty =
                    queue.lane_len(&acked.entity_type, &acked.entity_id) == 0;

                let mut commit = SyncCommit::default();
                commit.acks.push(id);
                if !lane_empty {
                    // Later mutations in the lane were stacked on the state
                    // the server just accepted; without a rebase their next
                    // push reads as a conflict against our own write.
                    commit.rebases =
                        queue.rebase_lane(&acked.entity_type, &acked.entity_id, version);
                }
                if acked.kind == tandem_engine::MutationKind::Delete {
                    // Server confirmed the delete: the tombstone has done
                    // its job.
                    commit
                        .purges
                        .push((acked.entity_type.clone(), acked.entity_id.clone()));
                } else {
                    let mut entity = self
                        .inner
                        .store
                        .read_any(&acked.entity_type, &acked.entity_id)
                        .await?
                        .ok_or_else(|| {
                            Error::Corrupt(format!(
                                "acked mutation for missing entity {}/{}",
                                acked.entity_type, acked.entity_id
                            ))
                        })?;
                    entity.acknowledge(version, updated_at, acked.payload.as_ref(), lane_empty);
                    commit.upserts.push(entity);
                }
                self.inner.store.commit(&commit).await?;
                session.pushed += 1;
                tracing::debug!(
                    entity_type = %acked.entity_type,
                    entity_id = %acked.entity_id,
                    version,
                    "mutation acknowledged"
                );
            }

            PushOutcome::Conflict {
                id,
                server_payload,
                server_version,
                server_updated_at,
            } => {
                session.conflicts_found += 1;
                let mut queue = self.inner.queue.lock().await;
                queue.mark_conflict(&id)?;

                let local = self
                    .inner
                    .store
                    .read_any(&mutation.entity_type, &mutation.entity_id)
                    .await?
                    .ok_or_else(|| {
                        Error::Corrupt(format!(
                            "conflicted mutation for missing entity {}/{}",
                            mutation.entity_type, mutation.entity_id
                        ))
                    })?;

                let sides = ConflictSides {
                    entity_type: mutation.entity_type.clone(),
                    entity_id: mutation.entity_id.clone(),
                    base_version: local.base_version(),
                    base_payload: local.base.as_ref().map(|b| b.payload.clone()),
                    client_payload: if local.deleted {
                        None
                    } else {
                        Some(local.payload.clone())
                    },
                    client_timestamp: mutation.client_timestamp,
                    server_payload,
                    server_version,
                    server_updated_at,
                };
                let resolver = Resolver::new(&self.inner.schema);
                let resolution = resolver.resolve(&sides)?;
                let record = ConflictRecord::new(
                    Uuid::new_v4().to_string(),
                    &sides,
                    wall_now_ms(),
                    &resolution,
                );
                tracing::info!(
                    entity_type = %sides.entity_type,
                    entity_id = %sides.entity_id,
                    resolution = ?resolution,
                    "conflict reported on push"
                );

                let mut commit = SyncCommit::default();
                match &resolution {
                    Resolution::Auto { state, .. } => {
                        plan_resolution(&local, &sides, state, &mut commit);
                        commit.conflicts.push(record);
                        self.inner.store.commit(&commit).await?;
                        for (entity_type, entity_id) in &commit.drop_lanes {
                            queue.take_lane(entity_type, entity_id);
                        }
                        for rebased in &commit.enqueues {
                            queue.enqueue(rebased.clone());
                        }
                    }
                    Resolution::Manual => {
                        // Lane stays held; persist the conflicted status so
                        // a restart restores the hold.
                        let mut row = mutation.clone();
                        row.transition(MutationStatus::Conflict)?;
                        self.inner.store.update_mutation(&row).await?;
                        commit.conflicts.push(record.clone());
                        self.inner.store.commit(&commit).await?;
                        drop(queue);
                        self.notify_presenter(std::slice::from_ref(&record)).await;
                    }
                }
            }

            PushOutcome::Rejected { id, code, reason } => {
                if code.is_transient() {
                    session.errors += 1;
                    tracing::warn!(%id, %reason, "push rejected transiently");
                    self.note_transient_failure(mutation, terminal).await?;
                } else {
                    tracing::error!(%id, ?code, %reason, "push rejected permanently");
                    let failed = {
                        let mut queue = self.inner.queue.lock().await;
                        queue.mark_failed_terminal(&id)?
                    };
                    self.inner.store.update_mutation(&failed).await?;
                    terminal.push(failed);
                }
            }
        }
        Ok(())
    }

    /// Schedule a retry for a transiently failed mutation, or retire it
    /// once its attempts are exhausted.
    async fn note_transient_failure(
        &self,
        mutation: &Mutation,
        terminal: &mut Vec<Mutation>,
    ) -> Result<()> {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let disposition = {
            let mut queue = self.inner.queue.lock().await;
            queue.mark_failed(
                &mutation.id,
                &self.inner.config.retry,
                self.mono_now(),
                jitter,
            )?
        };
        match disposition {
            FailureDisposition::RetryAt(at) => {
                let mut row = mutation.clone();
                row.transition(MutationStatus::Pending)?;
                row.not_before = Some(at);
                self.inner.store.update_mutation(&row).await?;
                tracing::debug!(id = %mutation.id, attempt = mutation.attempt, retry_at = at, "retry scheduled");
            }
            FailureDisposition::Terminal(failed) => {
                tracing::error!(id = %failed.id, attempts = failed.attempt, "mutation failed terminally");
                self.inner.store.update_mutation(&failed).await?;
                terminal.push(failed);
            }
        }
        Ok(())
    }

    /// Return in-flight lane heads to pending after a cycle died mid-push.
    /// Redelivery is safe: the server deduplicates by mutation ID. Row
    /// updates are best effort; [`LocalStore::load_queue`] applies the
    /// same normalization on the next start.
    async fn recover_in_flight(&self) {
        let recovered = {
            let mut queue = self.inner.queue.lock().await;
            queue.recover_in_flight()
        };
        for mutation in &recovered {
            if let Err(error) = self.inner.store.update_mutation(mutation).await {
                tracing::warn!(id = %mutation.id, %error, "failed to persist in-flight recovery");
            }
        }
        if !recovered.is_empty() {
            tracing::debug!(recovered = recovered.len(), "returned in-flight mutations to pending");
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn notify_presenter(&self, records: &[ConflictRecord]) {
        if records.is_empty() {
            return;
        }
        let presenter = self
            .inner
            .presenter
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(presenter) = presenter {
            presenter.review_requested(records).await;
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if *self.inner.cancel.borrow() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn backoff_sleep(&self, delay_ms: u64) -> Result<()> {
        if delay_ms == 0 {
            return Ok(());
        }
        let mut cancelled = self.inner.cancel.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(()),
            _ = cancelled.wait_for(|c| *c) => Err(Error::Cancelled),
        }
    }

    fn mono_now(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }
}

/// Translate an automatic resolution into store effects: the resolved
/// entity state, the superseded lane to drop, and (when the resolved state
/// still differs from the server's) a single re-based replacement
/// mutation.
fn plan_resolution(
    local: &Entity,
    sides: &ConflictSides,
    state: &ResolvedState,
    commit: &mut SyncCommit,
) {
    let key = (sides.entity_type.clone(), sides.entity_id.clone());
    commit.drop_lanes.push(key.clone());

    match state {
        ResolvedState::Deleted => {
            if let Some(server_payload) = &sides.server_payload {
                // Our tombstone won; the server does not know yet. Keep
                // the tombstone and push a delete based on the server's
                // current version.
                let now = wall_now_ms();
                let mut entity = local.clone();
                entity.deleted = true;
                entity.dirty = true;
                entity.updated_at = now;
                entity.base = Some(BaseState {
                    version: sides.server_version,
                    payload: server_payload.clone(),
                });
                commit.upserts.push(entity);
                commit.enqueues.push(Mutation::delete(
                    Uuid::new_v4().to_string(),
                    sides.entity_type.clone(),
                    sides.entity_id.clone(),
                    sides.server_version,
                    now,
                ));
            } else {
                // The server already deleted it; nothing left to push.
                commit.purges.push(key);
            }
        }
        ResolvedState::Payload { payload } => {
            if sides.server_payload.as_ref() == Some(payload) {
                // The server's state won outright; absorb it.
                let mut entity = local.clone();
                entity.absorb_server(
                    payload.clone(),
                    sides.server_version,
                    sides.server_updated_at,
                    false,
                );
                commit.upserts.push(entity);
            } else {
                // Merged or client-won state still needs to reach the
                // server: re-base on its current version and re-enqueue.
                let now = wall_now_ms();
                let mut entity = local.clone();
                entity.payload = payload.clone();
                entity.deleted = false;
                entity.dirty = true;
                entity.updated_at = now;
                entity.base = Some(BaseState {
                    version: sides.server_version,
                    payload: sides
                        .server_payload
                        .clone()
                        .unwrap_or_else(|| payload.clone()),
                });
                commit.upserts.push(entity);
                commit.enqueues.push(Mutation::update(
                    Uuid::new_v4().to_string(),
                    sides.entity_type.clone(),
                    sides.entity_id.clone(),
                    payload.clone(),
                    sides.server_version,
                    now,
                ));
            }
        }
    }
}
