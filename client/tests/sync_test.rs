//! End-to-end sync cycles against an in-process fake server.
//!
//! The fake server keeps a versioned entity log, deduplicates pushes by
//! mutation ID, and can be scripted to fail requests, which lets these
//! tests drive full multi-device flows: convergence, merges, deletes,
//! retries with backoff, crash recovery, and manual review. Backoff tests
//! run against the real clock with millisecond retry delays; pausing
//! tokio's clock would starve the sqlx pool's acquire timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tandem_client::{
    Config, ConflictPresenter, Error, LocalStore, PullPage, PushOutcome, RejectCode, Result,
    StaticKeyProvider, StaticTokenProvider, SyncContext, SyncEngine, SyncTransport,
};
use tandem_engine::{
    ConflictRecord, Cursor, FieldDef, FieldType, Mutation, MutationKind, ServerEntity, SyncSchema,
    TypePolicy,
};

// ============================================================================
// Fake server
// ============================================================================

#[derive(Clone)]
struct Stored {
    version: u64,
    updated_at: u64,
    deleted: bool,
    payload: Value,
}

#[derive(Default)]
struct ServerState {
    entities: HashMap<(String, String), Stored>,
    /// Every committed change, in commit order. Pull pages are slices of
    /// this log.
    log: Vec<ServerEntity>,
    /// Idempotency memory: outcome per mutation ID.
    outcomes: HashMap<String, PushOutcome>,
    /// `(mutation_id, entity_id, kind, attempt)` for every mutation the
    /// server actually processed, in arrival order.
    received: Vec<(String, String, MutationKind, u32)>,
    /// Fail this many push requests outright before processing.
    fail_push_requests: u32,
    /// Process the next push but drop the response, as if the network
    /// died on the way back.
    drop_next_push_response: bool,
    /// Answer the next push with garbage the client cannot decode,
    /// which surfaces as a non-transient error. Nothing is processed.
    garble_next_push_response: bool,
}

#[derive(Default)]
struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    fn fail_next_pushes(&self, n: u32) {
        self.state.lock().unwrap().fail_push_requests = n;
    }

    fn drop_next_push_response(&self) {
        self.state.lock().unwrap().drop_next_push_response = true;
    }

    fn garble_next_push_response(&self) {
        self.state.lock().unwrap().garble_next_push_response = true;
    }

    fn entity(&self, entity_type: &str, id: &str) -> Option<Stored> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned()
    }

    fn received_for(&self, entity_id: &str) -> Vec<(MutationKind, u32)> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(_, eid, _, _)| eid == entity_id)
            .map(|(_, _, kind, attempt)| (*kind, *attempt))
            .collect()
    }

    fn log_len(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }
}

#[async_trait]
impl SyncTransport for FakeServer {
    async fn pull(&self, cursor: &Cursor, limit: usize) -> Result<PullPage> {
        let state = self.state.lock().unwrap();
        let from: usize = if cursor.is_start() {
            0
        } else {
            cursor
                .as_str()
                .parse()
                .map_err(|_| Error::Transport("bad cursor".into()))?
        };
        let to = (from + limit).min(state.log.len());
        Ok(PullPage {
            entities: state.log[from..to].to_vec(),
            next_cursor: Cursor::from(to.to_string()),
            has_more: to < state.log.len(),
        })
    }

    async fn push(&self, batch: &[Mutation]) -> Result<Vec<PushOutcome>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push_requests > 0 {
            state.fail_push_requests -= 1;
            return Err(Error::Transport("induced outage".into()));
        }
        if state.garble_next_push_response {
            state.garble_next_push_response = false;
            return Err(Error::Corrupt("undecodable push response".into()));
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        for mutation in batch {
            state.received.push((
                mutation.id.clone(),
                mutation.entity_id.clone(),
                mutation.kind,
                mutation.attempt,
            ));

            if let Some(previous) = state.outcomes.get(&mutation.id) {
                outcomes.push(previous.clone());
                continue;
            }

            let key = (mutation.entity_type.clone(), mutation.entity_id.clone());
            let current = state.entities.get(&key).cloned();
            let current_version = current.as_ref().map_or(0, |s| s.version);

            let outcome = if current_version != mutation.base_version {
                PushOutcome::Conflict {
                    id: mutation.id.clone(),
                    server_payload: current
                        .as_ref()
                        .filter(|s| !s.deleted)
                        .map(|s| s.payload.clone()),
                    server_version: current_version,
                    server_updated_at: current.as_ref().map_or(0, |s| s.updated_at),
                }
            } else {
                let version = current_version + 1;
                let updated_at = mutation.client_timestamp;
                let stored = match mutation.kind {
                    MutationKind::Delete => Stored {
                        version,
                        updated_at,
                        deleted: true,
                        payload: current.map_or(json!({}), |s| s.payload),
                    },
                    _ => Stored {
                        version,
                        updated_at,
                        deleted: false,
                        payload: mutation.payload.clone().unwrap_or(json!({})),
                    },
                };
                state.log.push(ServerEntity {
                    entity_type: key.0.clone(),
                    id: key.1.clone(),
                    version,
                    updated_at,
                    deleted: stored.deleted,
                    payload: stored.payload.clone(),
                });
                state.entities.insert(key, stored);
                PushOutcome::Acked {
                    id: mutation.id.clone(),
                    version,
                    updated_at,
                }
            };
            state.outcomes.insert(mutation.id.clone(), outcome.clone());
            outcomes.push(outcome);
        }

        if state.drop_next_push_response {
            state.drop_next_push_response = false;
            return Err(Error::Transport("response lost".into()));
        }
        Ok(outcomes)
    }
}

// ============================================================================
// Harness
// ============================================================================

fn schema() -> SyncSchema {
    SyncSchema::new(1)
        .with_type(
            TypePolicy::new(
                "tasks",
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::optional("description", FieldType::String),
                    FieldDef::optional("done", FieldType::Bool),
                ],
            )
            .with_completion_field("done"),
        )
        .with_type(TypePolicy::new(
            "events",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("startsAt", FieldType::Timestamp),
            ],
        ))
        .with_type(
            TypePolicy::new(
                "pointAdjustments",
                vec![
                    FieldDef::required("amount", FieldType::Int),
                    FieldDef::optional("reason", FieldType::String),
                ],
            )
            .with_manual_review(),
        )
}

fn context(device: &str) -> SyncContext {
    SyncContext {
        device_id: device.to_string(),
        family_scope: "family-1".to_string(),
        auth: Arc::new(StaticTokenProvider("test-token".into())),
    }
}

async fn device(name: &str, server: &Arc<FakeServer>) -> SyncEngine {
    device_with_config(name, server, Config::default()).await
}

/// Millisecond retry delays so backoff tests finish quickly on the real
/// clock. Jitter is disabled to keep timings predictable.
fn fast_retry_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 25;
    config.retry.max_delay_ms = 200;
    config.retry.jitter_frac = 0.0;
    config
}

async fn device_with_config(name: &str, server: &Arc<FakeServer>, config: Config) -> SyncEngine {
    let store = LocalStore::open_in_memory(&StaticKeyProvider([1u8; 32]))
        .await
        .unwrap();
    SyncEngine::new(
        store,
        Arc::clone(server) as Arc<dyn SyncTransport>,
        schema(),
        config,
        context(name),
    )
    .await
    .unwrap()
}

// ============================================================================
// Basic flows
// ============================================================================

#[tokio::test]
async fn create_reaches_server_and_goes_clean() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    let created = alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    assert_eq!(created.version, 0);
    assert!(created.dirty);

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 1);
    assert!(report.terminal_failures.is_empty());

    let local = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.version, 1);
    assert!(!local.dirty);
    assert!(local.base.is_none());
    assert_eq!(server.entity("tasks", "t-1").unwrap().version, 1);
}

#[tokio::test]
async fn own_echo_is_ignored_on_next_pull() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    // The second cycle pulls the echo of our own push and must not count
    // it as an application or disturb local state.
    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pulled, 0);
    assert_eq!(report.session.conflicts_found, 0);
    let local = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.version, 1);
    assert!(!local.dirty);
}

#[tokio::test]
async fn devices_observe_each_other() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    let report = bob.sync().await.unwrap();
    assert_eq!(report.session.pulled, 1);
    let seen = bob.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(seen.payload, json!({"title": "Dishes"}));
    assert_eq!(seen.version, 1);
}

#[tokio::test]
async fn delete_of_unsynced_create_never_reaches_server() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Oops"}))
        .await
        .unwrap();
    alice.remove("tasks", "t-1").await.unwrap();

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 0);
    assert_eq!(server.log_len(), 0);
    assert!(alice.get("tasks", "t-1").await.unwrap().is_none());
}

#[tokio::test]
async fn update_then_delete_arrive_in_order() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    alice
        .put("tasks", "t-1", json!({"title": "Dishes tonight"}))
        .await
        .unwrap();
    alice.remove("tasks", "t-1").await.unwrap();

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 2);

    let kinds: Vec<MutationKind> = server
        .received_for("t-1")
        .into_iter()
        .map(|(kind, _)| kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            MutationKind::Create,
            MutationKind::Update,
            MutationKind::Delete
        ]
    );
    assert!(server.entity("tasks", "t-1").unwrap().deleted);
    // The tombstone served its purpose and is gone.
    assert!(alice.get("tasks", "t-1").await.unwrap().is_none());
}

#[tokio::test]
async fn stacked_edits_push_without_self_conflict() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    // Two offline edits stack in the same lane, both based on version 1.
    // Once the first is acked the second must be re-based onto the new
    // server version instead of colliding with our own write.
    alice
        .put("tasks", "t-1", json!({"title": "Dishes tonight"}))
        .await
        .unwrap();
    alice
        .put("tasks", "t-1", json!({"title": "Dishes after dinner"}))
        .await
        .unwrap();

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 2);
    assert_eq!(report.session.conflicts_found, 0);
    assert!(alice.inbox().history().await.unwrap().is_empty());

    // Every push succeeded on its first attempt.
    assert_eq!(
        server.received_for("t-1"),
        vec![
            (MutationKind::Create, 1),
            (MutationKind::Update, 1),
            (MutationKind::Update, 1)
        ]
    );
    let stored = server.entity("tasks", "t-1").unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.payload, json!({"title": "Dishes after dinner"}));

    let local = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.version, 3);
    assert!(!local.dirty);
}

// ============================================================================
// Conflict convergence
// ============================================================================

#[tokio::test]
async fn both_devices_marking_done_converge_silently() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes", "done": false}))
        .await
        .unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice
        .put("tasks", "t-1", json!({"title": "Dishes", "done": true}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    // Bob marks it done offline, based on version 1.
    bob.put("tasks", "t-1", json!({"title": "Dishes", "done": true}))
        .await
        .unwrap();
    let report = bob.sync().await.unwrap();

    assert_eq!(report.session.conflicts_found, 1);
    assert_eq!(report.manual_conflicts, 0);
    let local = bob.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.payload["done"], true);
    assert!(!local.dirty);
    assert!(bob.inbox().list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn disjoint_edits_merge_and_converge() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;

    alice
        .put(
            "tasks",
            "t-1",
            json!({"title": "Dishes", "description": "kitchen"}),
        )
        .await
        .unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice
        .put(
            "tasks",
            "t-1",
            json!({"title": "Dishes tonight", "description": "kitchen"}),
        )
        .await
        .unwrap();
    alice.sync().await.unwrap();

    bob.put(
        "tasks",
        "t-1",
        json!({"title": "Dishes", "description": "use the good soap"}),
    )
    .await
    .unwrap();
    let report = bob.sync().await.unwrap();
    assert_eq!(report.session.conflicts_found, 1);

    let merged = json!({"title": "Dishes tonight", "description": "use the good soap"});
    let local = bob.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.payload, merged);
    assert!(!local.dirty); // the re-based merge was pushed and acked
    assert_eq!(local.version, 3);

    alice.sync().await.unwrap();
    let alices = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(alices.payload, merged);
}

#[tokio::test]
async fn delete_beats_concurrent_update_with_audit_trail() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;

    alice
        .put("events", "e-1", json!({"name": "Picnic", "startsAt": 100}))
        .await
        .unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice.remove("events", "e-1").await.unwrap();
    alice.sync().await.unwrap();

    // Bob reschedules offline; the delete still wins.
    bob.put("events", "e-1", json!({"name": "Picnic", "startsAt": 250}))
        .await
        .unwrap();
    let report = bob.sync().await.unwrap();

    assert_eq!(report.session.conflicts_found, 1);
    assert_eq!(report.manual_conflicts, 0);
    assert!(bob.get("events", "e-1").await.unwrap().is_none());

    // The discarded edit is documented, not silently dropped.
    let history = bob.inbox().history().await.unwrap();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert!(record.resolved);
    assert_eq!(record.client_data.as_ref().unwrap()["startsAt"], 250);

    // A later push for the dead entity never happens.
    let report = bob.sync().await.unwrap();
    assert_eq!(report.session.pushed, 0);
}

// ============================================================================
// Retries and idempotency
// ============================================================================

#[tokio::test]
async fn transient_failures_back_off_then_succeed() {
    let server = Arc::new(FakeServer::default());
    let alice = device_with_config("alice", &server, fast_retry_config()).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    server.fail_next_pushes(3);

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 1);
    assert_eq!(report.session.errors, 3);
    assert!(report.terminal_failures.is_empty());

    // The server only ever processed the fourth attempt.
    assert_eq!(
        server.received_for("t-1"),
        vec![(MutationKind::Create, 4)]
    );
    let local = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.version, 1);
    assert!(!local.dirty);
}

#[tokio::test]
async fn lost_response_replays_idempotently() {
    let server = Arc::new(FakeServer::default());
    let alice = device_with_config("alice", &server, fast_retry_config()).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    server.drop_next_push_response();

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 1);
    assert_eq!(report.session.errors, 1);

    // The server saw the mutation twice but applied it once.
    assert_eq!(server.received_for("t-1").len(), 2);
    assert_eq!(server.log_len(), 1);
    assert_eq!(server.entity("tasks", "t-1").unwrap().version, 1);
    let local = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.version, 1);
}

#[tokio::test]
async fn exhausted_retries_surface_terminally() {
    let server = Arc::new(FakeServer::default());
    let mut config = fast_retry_config();
    config.retry.max_attempts = 3;
    let alice = device_with_config("alice", &server, config).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    server.fail_next_pushes(u32::MAX);

    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 0);
    assert_eq!(report.terminal_failures.len(), 1);
    assert_eq!(report.terminal_failures[0].attempt, 3);

    // Failed terminally once; never dispatched again, but inspectable.
    let report = alice.sync().await.unwrap();
    assert!(report.terminal_failures.is_empty());
    assert_eq!(alice.failed_mutations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_interrupts_a_backing_off_cycle() {
    let server = Arc::new(FakeServer::default());
    // A long backoff parks the cycle in its retry sleep, where the cancel
    // must reach it.
    let mut config = Config::default();
    config.retry.base_delay_ms = 60_000;
    config.retry.jitter_frac = 0.0;
    let alice = device_with_config("alice", &server, config).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    server.fail_next_pushes(u32::MAX);

    let engine = alice.clone();
    let cycle = tokio::spawn(async move { engine.sync().await });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    alice.cancel();

    let result = cycle.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

// ============================================================================
// Crash recovery and single flight
// ============================================================================

#[tokio::test]
async fn queue_survives_restart() {
    let server = Arc::new(FakeServer::default());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tandem.db");
    let keys = StaticKeyProvider([9u8; 32]);

    {
        let store = LocalStore::open(&path, &keys).await.unwrap();
        let engine = SyncEngine::new(
            store,
            Arc::clone(&server) as Arc<dyn SyncTransport>,
            schema(),
            Config::default(),
            context("alice"),
        )
        .await
        .unwrap();
        engine
            .put("tasks", "t-1", json!({"title": "Dishes"}))
            .await
            .unwrap();
        engine
            .put("events", "e-1", json!({"name": "Picnic"}))
            .await
            .unwrap();
        // Process dies before ever syncing.
    }

    let store = LocalStore::open(&path, &keys).await.unwrap();
    let engine = SyncEngine::new(
        store,
        Arc::clone(&server) as Arc<dyn SyncTransport>,
        schema(),
        Config::default(),
        context("alice"),
    )
    .await
    .unwrap();

    let report = engine.sync().await.unwrap();
    assert_eq!(report.session.pushed, 2);
    assert_eq!(server.entity("tasks", "t-1").unwrap().version, 1);
    assert_eq!(server.entity("events", "e-1").unwrap().version, 1);
}

#[tokio::test]
async fn failed_cycle_releases_in_flight_mutations() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    // The push comes back unreadable, a non-transient error that aborts
    // the cycle with the mutation still marked in flight.
    server.garble_next_push_response();
    assert!(alice.sync().await.is_err());

    // The lane must not stay blocked behind the dead request: the next
    // cycle redispatches without a restart.
    let report = alice.sync().await.unwrap();
    assert_eq!(report.session.pushed, 1);
    assert_eq!(server.received_for("t-1"), vec![(MutationKind::Create, 2)]);
    assert_eq!(server.entity("tasks", "t-1").unwrap().version, 1);

    let local = alice.get("tasks", "t-1").await.unwrap().unwrap();
    assert_eq!(local.version, 1);
    assert!(!local.dirty);
}

#[tokio::test]
async fn scheduler_runs_cycles_on_trigger() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();

    let scheduler = tandem_client::SyncScheduler::spawn(alice.clone());
    scheduler.trigger(tandem_client::SyncTrigger::Manual);

    // Wait for the background task to run the cycle.
    let mut synced = false;
    for _ in 0..40 {
        if server.entity("tasks", "t-1").is_some() {
            synced = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(synced, "triggered cycle never reached the server");
    assert_eq!(server.entity("tasks", "t-1").unwrap().version, 1);
    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_out_a_backing_off_cycle() {
    let server = Arc::new(FakeServer::default());
    let mut config = Config::default();
    config.retry.base_delay_ms = 60_000;
    config.retry.jitter_frac = 0.0;
    let alice = device_with_config("alice", &server, config).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    server.fail_next_pushes(u32::MAX);

    let scheduler = tandem_client::SyncScheduler::spawn(alice.clone());
    scheduler.trigger(tandem_client::SyncTrigger::Manual);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The cycle is parked in a 60s retry sleep; shutdown must still
    // complete promptly because cancel interrupts the sleep.
    tokio::time::timeout(std::time::Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("scheduler task should exit promptly")
        .unwrap();
}

#[tokio::test]
async fn concurrent_sync_calls_are_single_flight() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;

    alice
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();

    let (a, b) = tokio::join!(alice.sync(), alice.sync());
    assert!(a.is_ok());
    assert!(b.is_ok());
    // The create was pushed exactly once between the two calls.
    assert_eq!(server.received_for("t-1").len(), 1);
    assert_eq!(server.log_len(), 1);
}

// ============================================================================
// Manual review
// ============================================================================

#[derive(Default)]
struct RecordingPresenter {
    seen: Mutex<Vec<ConflictRecord>>,
}

#[async_trait]
impl ConflictPresenter for RecordingPresenter {
    async fn review_requested(&self, records: &[ConflictRecord]) {
        self.seen.lock().unwrap().extend_from_slice(records);
    }
}

#[tokio::test]
async fn flagged_type_waits_for_manual_decision() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;
    let presenter = Arc::new(RecordingPresenter::default());
    bob.set_presenter(presenter.clone());

    alice
        .put("pointAdjustments", "p-1", json!({"amount": 10}))
        .await
        .unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice
        .put("pointAdjustments", "p-1", json!({"amount": 20}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    // Bob edits the same adjustment offline, plus an unrelated task.
    bob.put("pointAdjustments", "p-1", json!({"amount": 5}))
        .await
        .unwrap();
    bob.put("tasks", "t-9", json!({"title": "Unrelated"}))
        .await
        .unwrap();

    let report = bob.sync().await.unwrap();
    assert_eq!(report.manual_conflicts, 1);
    // The held lane did not block the unrelated one.
    assert_eq!(server.entity("tasks", "t-9").unwrap().version, 1);
    // Local state keeps Bob's value while the decision is pending.
    let local = bob.get("pointAdjustments", "p-1").await.unwrap().unwrap();
    assert_eq!(local.payload["amount"], 5);
    assert!(local.dirty);
    assert_eq!(presenter.seen.lock().unwrap().len(), 1);

    let pending = bob.inbox().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    let record = &pending[0];
    assert_eq!(record.client_data.as_ref().unwrap()["amount"], 5);
    assert_eq!(record.server_data.as_ref().unwrap()["amount"], 20);

    // The user picks a third value; it re-bases and pushes.
    bob.inbox()
        .resolve(&record.id, Some(json!({"amount": 25})))
        .await
        .unwrap();
    let report = bob.sync().await.unwrap();
    assert_eq!(report.session.pushed, 1);
    assert_eq!(report.manual_conflicts, 0);

    let settled = server.entity("pointAdjustments", "p-1").unwrap();
    assert_eq!(settled.payload["amount"], 25);
    assert_eq!(settled.version, 3);
    assert!(bob.inbox().list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_decision_can_accept_server_state() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;

    alice
        .put("pointAdjustments", "p-1", json!({"amount": 10}))
        .await
        .unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice
        .put("pointAdjustments", "p-1", json!({"amount": 20}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    bob.put("pointAdjustments", "p-1", json!({"amount": 5}))
        .await
        .unwrap();
    bob.sync().await.unwrap();

    let pending = bob.inbox().list_pending().await.unwrap();
    bob.inbox().resolve(&pending[0].id, None).await.unwrap();

    let local = bob.get("pointAdjustments", "p-1").await.unwrap().unwrap();
    assert_eq!(local.payload["amount"], 20);
    assert!(!local.dirty);

    // Nothing left to push for the lane.
    let report = bob.sync().await.unwrap();
    assert_eq!(report.session.pushed, 0);
    assert_eq!(server.entity("pointAdjustments", "p-1").unwrap().version, 2);
}

#[tokio::test]
async fn tombstone_still_resolves_automatically_for_flagged_types() {
    let server = Arc::new(FakeServer::default());
    let alice = device("alice", &server).await;
    let bob = device("bob", &server).await;

    alice
        .put("pointAdjustments", "p-1", json!({"amount": 10}))
        .await
        .unwrap();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice.remove("pointAdjustments", "p-1").await.unwrap();
    alice.sync().await.unwrap();

    bob.put("pointAdjustments", "p-1", json!({"amount": 99}))
        .await
        .unwrap();
    let report = bob.sync().await.unwrap();

    // Delete precedence applies even to manual-review types.
    assert_eq!(report.manual_conflicts, 0);
    assert!(bob.get("pointAdjustments", "p-1").await.unwrap().is_none());
}

// ============================================================================
// Permanent rejections
// ============================================================================

/// Rejects everything permanently; used to exercise the terminal path.
struct RejectingServer;

#[async_trait]
impl SyncTransport for RejectingServer {
    async fn pull(&self, _cursor: &Cursor, _limit: usize) -> Result<PullPage> {
        Ok(PullPage {
            entities: Vec::new(),
            next_cursor: Cursor::start(),
            has_more: false,
        })
    }

    async fn push(&self, batch: &[Mutation]) -> Result<Vec<PushOutcome>> {
        Ok(batch
            .iter()
            .map(|m| PushOutcome::Rejected {
                id: m.id.clone(),
                code: RejectCode::MalformedPayload,
                reason: "rejected by policy".into(),
            })
            .collect())
    }
}

#[tokio::test]
async fn permanent_rejection_skips_the_backoff_loop() {
    let store = LocalStore::open_in_memory(&StaticKeyProvider([1u8; 32]))
        .await
        .unwrap();
    let engine = SyncEngine::new(
        store,
        Arc::new(RejectingServer),
        schema(),
        Config::default(),
        context("alice"),
    )
    .await
    .unwrap();

    engine
        .put("tasks", "t-1", json!({"title": "Dishes"}))
        .await
        .unwrap();
    let report = engine.sync().await.unwrap();

    assert_eq!(report.terminal_failures.len(), 1);
    assert_eq!(report.terminal_failures[0].attempt, 1);
    assert_eq!(report.session.errors, 0);
}
