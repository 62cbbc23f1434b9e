//! Latest presence record per user.

use std::collections::HashMap;

use locus_core::UserId;
use locus_core::time::stamp_after;
use tokio_util::sync::CancellationToken;

use super::record::{PresenceRecord, StateUpdate};

/// The single visibility rule.
///
/// A record is visible to its owner, to everyone when public, and to admins.
pub fn is_visible(owner: &UserId, public: bool, viewer: &UserId, viewer_is_admin: bool) -> bool {
    viewer == owner || public || viewer_is_admin
}

/// Result of an [`PresenceStore::upsert`].
#[derive(Clone, Debug)]
pub struct Upserted {
    /// The record as stored after the write.
    pub record: PresenceRecord,
    /// Visibility before the write (`false` if there was no record).
    pub previous_visibility: bool,
}

impl Upserted {
    /// Whether the write flipped visibility.
    pub fn visibility_changed(&self) -> bool {
        self.previous_visibility != self.record.show_location_to_everyone
    }
}

/// A pending purge, scheduled when a record is tombstoned.
#[derive(Debug)]
pub struct PendingPurge {
    /// Identifies this tombstone; a purge for an older one is ignored.
    pub generation: u64,
    /// Cancelled when the record is revived or the store is cleared.
    pub cancel: CancellationToken,
}

struct Tombstone {
    generation: u64,
    cancel: CancellationToken,
}

/// Map of user ID to that user's latest record, plus tombstone bookkeeping.
#[derive(Default)]
pub struct PresenceStore {
    records: HashMap<UserId, PresenceRecord>,
    tombstones: HashMap<UserId, Tombstone>,
    next_generation: u64,
}

impl PresenceStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update from `user_id`.
    ///
    /// Fields absent from the update keep their stored value. Any tombstone
    /// is cleared and its pending purge cancelled.
    pub fn upsert(&mut self, user_id: &UserId, username: &str, update: StateUpdate) -> Upserted {
        if let Some(tombstone) = self.tombstones.remove(user_id) {
            tombstone.cancel.cancel();
        }

        let record = self
            .records
            .entry(user_id.clone())
            .or_insert_with(|| PresenceRecord::new(user_id.clone(), username.to_string(), 0));
        let previous_visibility = record.show_location_to_everyone;

        record.username = username.to_string();
        if let Some(coordinates) = update.coordinates {
            record.lat = Some(coordinates.lat);
            record.lng = Some(coordinates.lng);
            record.accuracy = update.accuracy;
        } else if update.accuracy.is_some() {
            record.accuracy = update.accuracy;
        }
        if let Some(show) = update.show_location_to_everyone {
            record.show_location_to_everyone = show;
        }
        if !update.extra.is_empty() {
            record.extra = update.extra;
        }
        record.is_disconnected = false;
        record.disconnected_at = None;
        record.timestamp = stamp_after(Some(record.timestamp));

        Upserted {
            record: record.clone(),
            previous_visibility,
        }
    }

    /// Advance a user's timestamp without changing state. Returns the stamp.
    pub fn touch(&mut self, user_id: &UserId) -> Option<i64> {
        let record = self.records.get_mut(user_id)?;
        record.timestamp = stamp_after(Some(record.timestamp));
        Some(record.timestamp)
    }

    /// Mark a user's record as disconnected.
    ///
    /// Returns the purge to schedule, or `None` if the user has no record.
    /// Re-tombstoning supersedes the earlier purge.
    pub fn tombstone(&mut self, user_id: &UserId) -> Option<PendingPurge> {
        let record = self.records.get_mut(user_id)?;
        let stamp = stamp_after(Some(record.timestamp));
        record.timestamp = stamp;
        record.is_disconnected = true;
        record.disconnected_at = Some(stamp);

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        if let Some(previous) = self.tombstones.insert(
            user_id.clone(),
            Tombstone {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }
        Some(PendingPurge { generation, cancel })
    }

    /// Remove a tombstoned record if `generation` is still its tombstone.
    pub fn purge(&mut self, user_id: &UserId, generation: u64) -> bool {
        let current = self
            .tombstones
            .get(user_id)
            .is_some_and(|t| t.generation == generation);
        let disconnected = self.records.get(user_id).is_some_and(|r| r.is_disconnected);
        if !(current && disconnected) {
            return false;
        }
        let _ = self.tombstones.remove(user_id);
        let _ = self.records.remove(user_id);
        true
    }

    /// A user's record.
    pub fn get(&self, user_id: &UserId) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    /// Records the viewer may see, tombstoned ones included.
    pub fn snapshot_for<'a>(
        &'a self,
        viewer: &'a UserId,
        viewer_is_admin: bool,
    ) -> impl Iterator<Item = &'a PresenceRecord> + 'a {
        self.records.values().filter(move |record| {
            is_visible(
                &record.user_id,
                record.show_location_to_everyone,
                viewer,
                viewer_is_admin,
            )
        })
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Live records that carry a location.
    pub fn sharing_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.is_disconnected && r.has_location())
            .count()
    }

    /// Live records with a location that everyone may see.
    pub fn public_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.is_disconnected && r.has_location() && r.show_location_to_everyone)
            .count()
    }

    /// Tombstones awaiting purge.
    pub fn pending_purges(&self) -> usize {
        self.tombstones.len()
    }

    /// Drop everything and cancel every pending purge.
    pub fn clear(&mut self) {
        for (_, tombstone) in self.tombstones.drain() {
            tombstone.cancel.cancel();
        }
        self.records.clear();
    }
}
