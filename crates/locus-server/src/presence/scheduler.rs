//! Throttled rebroadcast bookkeeping and the timer loops behind it.
//!
//! At most one pending entry exists per user. Scheduling while an entry is
//! pending leaves the running timer alone instead of restarting it, so a
//! client reporting faster than the interval still gets one rebroadcast per
//! interval (see "Throttle cadence" in DESIGN.md). The timer re-reads the
//! store when it fires, so entries carry no snapshot of their own.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use locus_core::UserId;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A queued rebroadcast for one user.
#[derive(Debug)]
struct PendingUpdate {
    generation: u64,
    cancel: CancellationToken,
}

/// What [`UpdateScheduler::schedule`] did.
#[derive(Debug)]
pub enum Scheduled {
    /// No entry existed; the caller must start a timer with these handles.
    Started {
        /// Identifies the new entry.
        generation: u64,
        /// Stops the timer.
        cancel: CancellationToken,
    },
    /// An entry was already pending; its timer keeps running.
    Coalesced,
}

/// Pending rebroadcasts keyed by user.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    pending: HashMap<UserId, PendingUpdate>,
    next_generation: u64,
}

impl UpdateScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a rebroadcast for `user_id`.
    pub fn schedule(&mut self, user_id: &UserId) -> Scheduled {
        if self.pending.contains_key(user_id) {
            return Scheduled::Coalesced;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        let _ = self.pending.insert(
            user_id.clone(),
            PendingUpdate {
                generation,
                cancel: cancel.clone(),
            },
        );
        Scheduled::Started { generation, cancel }
    }

    /// Whether `generation` is still the pending entry for `user_id`.
    pub fn is_current(&self, user_id: &UserId, generation: u64) -> bool {
        self.pending
            .get(user_id)
            .is_some_and(|e| e.generation == generation)
    }

    /// Drop the pending entry and stop its timer.
    pub fn cancel(&mut self, user_id: &UserId) -> bool {
        match self.pending.remove(user_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything.
    pub fn cancel_all(&mut self) {
        for (_, entry) in self.pending.drain() {
            entry.cancel.cancel();
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Call `fire` every `interval` until it returns `false` or `cancel` fires.
///
/// The first call happens one interval after start.
pub fn run_repeating<F>(
    interval: Duration,
    cancel: CancellationToken,
    mut fire: F,
) -> impl Future<Output = ()> + Send
where
    F: FnMut() -> bool + Send + 'static,
{
    async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if !fire() {
                        return;
                    }
                }
            }
        }
    }
}

/// Call `fire` once after `delay` unless `cancel` fires first.
pub fn run_once<F>(delay: Duration, cancel: CancellationToken, fire: F) -> impl Future<Output = ()> + Send
where
    F: FnOnce() + Send + 'static,
{
    async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => fire(),
        }
    }
}
