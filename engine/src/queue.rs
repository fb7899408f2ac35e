//! The mutation queue - ordered, per-entity lanes of pending operations.
//!
//! Mutations targeting the same `(entity_type, entity_id)` form a lane.
//! Within a lane order is never changed; across lanes the oldest eligible
//! head is dispatched first. At most one mutation per lane is in flight at
//! any time, so the server observes each entity's history in causal order.
//!
//! Durability is the caller's concern: the queue is rebuilt from persisted
//! rows at startup via [`MutationQueue::restore`] and every status change
//! is mirrored to storage by the orchestrator.

use crate::{EntityId, EntityType, Error, Mutation, MutationId, MutationKind, MutationStatus,
            Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies one lane: all mutations for a single entity.
pub type LaneKey = (EntityType, EntityId);

/// Retry policy for transient push failures.
///
/// Delays grow exponentially from `base_delay_ms`, doubling per attempt,
/// capped at `max_delay_ms`, with multiplicative jitter of up to
/// `jitter_frac`. The jitter sample itself (a unit-interval value) is
/// supplied by the caller so the engine stays deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on the computed delay, in milliseconds
    pub max_delay_ms: u64,
    /// Attempts after which a mutation becomes FailedTerminal
    pub max_attempts: u32,
    /// Fraction of the delay added as jitter (0.0 disables jitter)
    pub jitter_frac: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 8,
            jitter_frac: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given that `attempt` attempts have
    /// already failed. `jitter_unit` must be in `[0, 1)`.
    pub fn delay_ms(&self, attempt: u32, jitter_unit: f64) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let jitter = (raw as f64 * self.jitter_frac * jitter_unit) as u64;
        raw + jitter
    }
}

/// What became of a failed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Transient failure: retry no earlier than this instant
    RetryAt(Timestamp),
    /// Attempts exhausted or permanent rejection: removed from the queue,
    /// surfaced to the caller
    Terminal(Mutation),
}

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to the lane
    Queued,
    /// Create followed by delete before ever syncing: both dropped, the
    /// server never needs to hear about this entity
    CompactedAway,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    mutation: Mutation,
}

#[derive(Debug, Clone, Default)]
struct Lane {
    entries: Vec<Entry>,
    held: bool,
}

/// Ordered multi-lane queue of pending mutations.
#[derive(Debug, Clone, Default)]
pub struct MutationQueue {
    lanes: HashMap<LaneKey, Lane>,
    next_seq: u64,
}

impl MutationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted mutations, preserving their order.
    pub fn restore(mutations: impl IntoIterator<Item = Mutation>) -> Self {
        let mut queue = Self::new();
        for mutation in mutations {
            let key = lane_key(&mutation);
            let held = mutation.status == MutationStatus::Conflict;
            let seq = queue.next_seq;
            queue.next_seq += 1;
            let lane = queue.lanes.entry(key).or_default();
            lane.entries.push(Entry { seq, mutation });
            if held {
                lane.held = true;
            }
        }
        queue
    }

    /// Total number of queued mutations.
    pub fn len(&self) -> usize {
        self.lanes.values().map(|l| l.entries.len()).sum()
    }

    /// Whether the queue holds no mutations at all.
    pub fn is_empty(&self) -> bool {
        self.lanes.values().all(|l| l.entries.is_empty())
    }

    /// Number of mutations queued for one entity.
    pub fn lane_len(&self, entity_type: &str, entity_id: &str) -> usize {
        self.lanes
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .map_or(0, |l| l.entries.len())
    }

    /// Append a mutation to its lane.
    ///
    /// A `Delete` arriving while the lane still starts with an unsynced
    /// `Create` compacts the whole lane away: the record never reached the
    /// server, so there is nothing to delete remotely.
    pub fn enqueue(&mut self, mutation: Mutation) -> EnqueueOutcome {
        let key = lane_key(&mutation);

        if mutation.kind == MutationKind::Delete {
            if let Some(lane) = self.lanes.get(&key) {
                let unsynced_create = !lane.held
                    && lane
                        .entries
                        .first()
                        .map_or(false, |e| e.mutation.kind == MutationKind::Create)
                    && lane
                        .entries
                        .iter()
                        .all(|e| e.mutation.status == MutationStatus::Pending);
                if unsynced_create {
                    self.lanes.remove(&key);
                    return EnqueueOutcome::CompactedAway;
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.lanes
            .entry(key)
            .or_default()
            .entries
            .push(Entry { seq, mutation });
        EnqueueOutcome::Queued
    }

    /// Oldest eligible mutation per lane, across lanes in enqueue order,
    /// at most `limit` total. Lanes that are held, backing off, or already
    /// have a mutation in flight contribute nothing.
    pub fn next_batch(&self, limit: usize, now: Timestamp) -> Vec<Mutation> {
        let mut heads: Vec<&Entry> = self
            .lanes
            .values()
            .filter(|lane| !lane.held)
            .filter_map(|lane| lane.entries.first())
            .filter(|entry| entry.mutation.is_eligible(now))
            .collect();
        heads.sort_by_key(|e| e.seq);
        heads
            .into_iter()
            .take(limit)
            .map(|e| e.mutation.clone())
            .collect()
    }

    /// Earliest `not_before` among lane heads that are only waiting out a
    /// backoff delay. `None` when nothing is scheduled for later retry.
    pub fn next_not_before(&self, now: Timestamp) -> Option<Timestamp> {
        self.lanes
            .values()
            .filter(|lane| !lane.held)
            .filter_map(|lane| lane.entries.first())
            .filter(|e| e.mutation.status == MutationStatus::Pending)
            .filter_map(|e| e.mutation.not_before)
            .filter(|t| *t > now)
            .min()
    }

    /// Mark a lane head as dispatched. Increments its attempt counter.
    pub fn mark_in_flight(&mut self, id: &str) -> crate::error::Result<()> {
        let entry = self.head_mut(id)?;
        entry.mutation.transition(MutationStatus::InFlight)?;
        entry.mutation.attempt += 1;
        entry.mutation.not_before = None;
        Ok(())
    }

    /// Acknowledge a mutation: removed from its lane and returned.
    pub fn mark_acked(&mut self, id: &str) -> crate::error::Result<Mutation> {
        let key = self.key_of(id)?;
        let lane = self.lanes.get_mut(&key).expect("lane exists for key");
        lane.entries[0].mutation.transition(MutationStatus::Acked)?;
        let entry = lane.entries.remove(0);
        if lane.entries.is_empty() {
            self.lanes.remove(&key);
        }
        Ok(entry.mutation)
    }

    /// Rewrite the base version of everything still queued for one entity.
    ///
    /// Called after an acknowledgment: the remaining lane entries were
    /// stacked on local state the server has now assigned `version`, so
    /// pushing them with their original base would read as a conflict
    /// against our own just-acked write. Returns the rewritten mutations
    /// so the caller can mirror the change to storage.
    pub fn rebase_lane(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        version: Version,
    ) -> Vec<Mutation> {
        let Some(lane) = self
            .lanes
            .get_mut(&(entity_type.to_string(), entity_id.to_string()))
        else {
            return Vec::new();
        };
        lane.entries
            .iter_mut()
            .map(|entry| {
                entry.mutation.base_version = version;
                entry.mutation.clone()
            })
            .collect()
    }

    /// Return any in-flight lane heads to pending.
    ///
    /// Used when a cycle aborts partway through a push round: the request
    /// may or may not have reached the server, and the idempotency key
    /// makes redelivery safe. Without this the lane would sit blocked
    /// until the process restarts.
    pub fn recover_in_flight(&mut self) -> Vec<Mutation> {
        let mut recovered = Vec::new();
        for lane in self.lanes.values_mut() {
            if let Some(entry) = lane.entries.first_mut() {
                if entry.mutation.status == MutationStatus::InFlight {
                    entry.mutation.status = MutationStatus::Pending;
                    entry.mutation.not_before = None;
                    recovered.push(entry.mutation.clone());
                }
            }
        }
        recovered
    }

    /// Record a transient failure. Either schedules a retry under `policy`
    /// or, once attempts are exhausted, removes the mutation as terminal.
    pub fn mark_failed(
        &mut self,
        id: &str,
        policy: &RetryPolicy,
        now: Timestamp,
        jitter_unit: f64,
    ) -> crate::error::Result<FailureDisposition> {
        let key = self.key_of(id)?;
        let lane = self.lanes.get_mut(&key).expect("lane exists for key");
        let head = &mut lane.entries[0].mutation;

        if head.attempt >= policy.max_attempts {
            head.transition(MutationStatus::FailedTerminal)?;
            let entry = lane.entries.remove(0);
            if lane.entries.is_empty() {
                self.lanes.remove(&key);
            }
            return Ok(FailureDisposition::Terminal(entry.mutation));
        }

        head.transition(MutationStatus::Pending)?;
        let retry_at = now + policy.delay_ms(head.attempt, jitter_unit);
        head.not_before = Some(retry_at);
        Ok(FailureDisposition::RetryAt(retry_at))
    }

    /// Fail a mutation immediately, regardless of remaining attempts.
    /// Used for permanent rejections (malformed payload, authorization).
    pub fn mark_failed_terminal(&mut self, id: &str) -> crate::error::Result<Mutation> {
        let key = self.key_of(id)?;
        let lane = self.lanes.get_mut(&key).expect("lane exists for key");
        lane.entries[0]
            .mutation
            .transition(MutationStatus::FailedTerminal)?;
        let entry = lane.entries.remove(0);
        if lane.entries.is_empty() {
            self.lanes.remove(&key);
        }
        Ok(entry.mutation)
    }

    /// Mark a mutation as conflicted and hold its lane until resolution.
    pub fn mark_conflict(&mut self, id: &str) -> crate::error::Result<()> {
        let key = self.key_of(id)?;
        let lane = self.lanes.get_mut(&key).expect("lane exists for key");
        lane.entries[0].mutation.transition(MutationStatus::Conflict)?;
        lane.held = true;
        Ok(())
    }

    /// Drain a whole lane, releasing its hold. Used after conflict
    /// resolution: the caller either drops the drained mutations or
    /// enqueues a re-based replacement.
    pub fn take_lane(&mut self, entity_type: &str, entity_id: &str) -> Vec<Mutation> {
        self.lanes
            .remove(&(entity_type.to_string(), entity_id.to_string()))
            .map(|lane| lane.entries.into_iter().map(|e| e.mutation).collect())
            .unwrap_or_default()
    }

    /// Park a lane without touching its entries.
    pub fn hold_lane(&mut self, entity_type: &str, entity_id: &str) {
        if let Some(lane) = self
            .lanes
            .get_mut(&(entity_type.to_string(), entity_id.to_string()))
        {
            lane.held = true;
        }
    }

    /// Release a previously held lane.
    pub fn release_lane(&mut self, entity_type: &str, entity_id: &str) {
        if let Some(lane) = self
            .lanes
            .get_mut(&(entity_type.to_string(), entity_id.to_string()))
        {
            lane.held = false;
        }
    }

    /// Whether a lane is currently held.
    pub fn is_lane_held(&self, entity_type: &str, entity_id: &str) -> bool {
        self.lanes
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .map_or(false, |l| l.held)
    }

    /// All queued mutations in enqueue order (for persistence and tests).
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut entries: Vec<&Entry> = self
            .lanes
            .values()
            .flat_map(|l| l.entries.iter())
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.mutation.clone()).collect()
    }

    fn key_of(&self, id: &str) -> crate::error::Result<LaneKey> {
        for (key, lane) in &self.lanes {
            if let Some(head) = lane.entries.first() {
                if head.mutation.id == id {
                    return Ok(key.clone());
                }
                // Only lane heads may change status; anything deeper in a
                // lane is by definition not in flight.
                if lane.entries.iter().any(|e| e.mutation.id == id) {
                    return Err(Error::LaneBusy {
                        entity_type: key.0.clone(),
                        entity_id: key.1.clone(),
                    });
                }
            }
        }
        Err(Error::MutationNotFound(id.to_string()))
    }

    fn head_mut(&mut self, id: &str) -> crate::error::Result<&mut Entry> {
        let key = self.key_of(id)?;
        let lane = self.lanes.get_mut(&key).expect("lane exists for key");
        Ok(&mut lane.entries[0])
    }
}

fn lane_key(mutation: &Mutation) -> LaneKey {
    (mutation.entity_type.clone(), mutation.entity_id.clone())
}
