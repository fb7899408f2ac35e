//! Background sync triggering.
//!
//! The scheduler owns a task that runs a cycle on a periodic interval and
//! on demand when the application reports a trigger (foregrounding,
//! connectivity regained, an explicit refresh). Because `sync()` is
//! single-flight, overlapping triggers simply join the running cycle.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::SyncEngine;

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The application came to the foreground
    Foreground,
    /// The device regained connectivity
    ConnectivityRegained,
    /// The periodic interval elapsed
    Interval,
    /// The user asked for a refresh
    Manual,
}

/// Drives periodic and on-demand sync cycles.
pub struct SyncScheduler {
    engine: SyncEngine,
    triggers: mpsc::Sender<SyncTrigger>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawn the background task. It runs until
    /// [`SyncScheduler::shutdown`] is called.
    pub fn spawn(engine: SyncEngine) -> Self {
        let interval = engine_interval(&engine);
        let (triggers, mut rx) = mpsc::channel(16);
        let (stop, mut stopped) = watch::channel(false);
        let task_engine = engine.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let trigger = tokio::select! {
                    _ = stopped.wait_for(|s| *s) => break,
                    _ = ticker.tick() => SyncTrigger::Interval,
                    received = rx.recv() => match received {
                        Some(trigger) => trigger,
                        None => break,
                    },
                };
                // Triggers buffered before shutdown must not start a
                // fresh cycle after it.
                if *stopped.borrow() {
                    break;
                }
                tracing::debug!(?trigger, "sync triggered");
                if let Err(error) = task_engine.sync().await {
                    tracing::warn!(%error, ?trigger, "sync cycle failed");
                }
            }
        });
        Self {
            engine,
            triggers,
            stop,
            task,
        }
    }

    /// Request a cycle. Never blocks; if the trigger buffer is full a
    /// cycle is already imminent and the trigger is redundant.
    pub fn trigger(&self, trigger: SyncTrigger) {
        let _ = self.triggers.try_send(trigger);
    }

    /// Stop the background task. An in-progress cycle is cancelled at its
    /// next step boundary; everything already committed stays committed.
    /// The task is never aborted mid-commit: the stop signal ends the
    /// loop, the cycle observes the cancel flag, and the task exits on
    /// its own. Await the returned handle to wait for it.
    pub fn shutdown(self) -> JoinHandle<()> {
        let _ = self.stop.send(true);
        self.engine.cancel();
        drop(self.triggers);
        self.task
    }
}

fn engine_interval(engine: &SyncEngine) -> std::time::Duration {
    engine.config().sync_interval
}
