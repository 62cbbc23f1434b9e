//! Recipient selection.
//!
//! Everything here runs under the hub lock and only decides who gets which
//! frame; the hub hands the frames over once the lock is released.

use std::sync::Arc;

use locus_core::UserId;

use super::record::{EncodedFrames, PresenceRecord};
use super::registry::ConnectionRegistry;
use super::store::{PresenceStore, is_visible};
use crate::websocket::connection::ClientConnection;

/// One frame bound for one connection.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Recipient.
    pub connection: Arc<ClientConnection>,
    /// Serialized frame.
    pub frame: Arc<String>,
}

impl Delivery {
    fn new(connection: &Arc<ClientConnection>, frame: &Arc<String>) -> Self {
        Self {
            connection: Arc::clone(connection),
            frame: Arc::clone(frame),
        }
    }
}

/// Send a record (or an action) to everyone allowed to see its owner.
///
/// The owner gets the `isSelf` copy.
pub fn to_visible(
    registry: &ConnectionRegistry,
    owner: &UserId,
    public: bool,
    frames: &EncodedFrames,
) -> Vec<Delivery> {
    registry
        .all()
        .filter_map(|conn| {
            if &conn.user_id == owner {
                Some(Delivery::new(conn, &frames.for_owner))
            } else if is_visible(owner, public, &conn.user_id, conn.is_admin) {
                Some(Delivery::new(conn, &frames.for_others))
            } else {
                None
            }
        })
        .collect()
}

/// Send a record to everyone allowed to see it.
pub fn record_to_visible(
    registry: &ConnectionRegistry,
    record: &PresenceRecord,
    frames: &EncodedFrames,
) -> Vec<Delivery> {
    to_visible(
        registry,
        &record.user_id,
        record.show_location_to_everyone,
        frames,
    )
}

/// Echo a record to its owner only.
pub fn to_owner(registry: &ConnectionRegistry, owner: &UserId, frames: &EncodedFrames) -> Vec<Delivery> {
    registry
        .get(owner)
        .map(|conn| Delivery::new(conn, &frames.for_owner))
        .into_iter()
        .collect()
}

/// Send a frame to every connection.
pub fn to_all(registry: &ConnectionRegistry, frame: &Arc<String>) -> Vec<Delivery> {
    registry.all().map(|conn| Delivery::new(conn, frame)).collect()
}

/// Send a frame to everyone who loses sight of `owner` when it goes private.
pub fn to_revoked(registry: &ConnectionRegistry, owner: &UserId, frame: &Arc<String>) -> Vec<Delivery> {
    registry
        .all()
        .filter(|conn| &conn.user_id != owner && !conn.is_admin)
        .map(|conn| Delivery::new(conn, frame))
        .collect()
}

/// Frames a newly connected viewer receives for existing records.
pub fn catch_up(
    store: &PresenceStore,
    viewer: &UserId,
    viewer_is_admin: bool,
) -> Result<Vec<Arc<String>>, serde_json::Error> {
    store
        .snapshot_for(viewer, viewer_is_admin)
        .map(|record| {
            let frames = record.encode()?;
            Ok(if &record.user_id == viewer {
                frames.for_owner
            } else {
                frames.for_others
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::record::{Coordinates, StateUpdate};
    use crate::websocket::connection::test_support::connection;
    use locus_auth::Role;

    fn recipients(deliveries: &[Delivery]) -> Vec<String> {
        let mut users: Vec<String> = deliveries
            .iter()
            .map(|d| d.connection.user_id.to_string())
            .collect();
        users.sort();
        users
    }

    fn setup() -> (ConnectionRegistry, Vec<tokio::sync::mpsc::Receiver<crate::websocket::connection::OutboundFrame>>) {
        let mut registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for (user, role) in [("owner", Role::Member), ("peer", Role::Member), ("boss", Role::Admin)] {
            let (conn, rx) = connection(user, role, 8);
            let _ = registry.register(conn);
            receivers.push(rx);
        }
        (registry, receivers)
    }

    fn record(public: bool) -> PresenceRecord {
        let mut record = PresenceRecord::new(UserId::from("owner"), "name-owner".into(), 1);
        record.lat = Some(1.0);
        record.lng = Some(1.0);
        record.show_location_to_everyone = public;
        record
    }

    #[test]
    fn private_record_reaches_owner_and_admins() {
        let (registry, _rx) = setup();
        let record = record(false);
        let frames = record.encode().unwrap();
        let deliveries = record_to_visible(&registry, &record, &frames);
        assert_eq!(recipients(&deliveries), vec!["boss", "owner"]);

        let own = deliveries
            .iter()
            .find(|d| d.connection.user_id.as_str() == "owner")
            .unwrap();
        assert!(Arc::ptr_eq(&own.frame, &frames.for_owner));
    }

    #[test]
    fn public_record_reaches_everyone() {
        let (registry, _rx) = setup();
        let record = record(true);
        let frames = record.encode().unwrap();
        assert_eq!(
            recipients(&record_to_visible(&registry, &record, &frames)),
            vec!["boss", "owner", "peer"]
        );
    }

    #[test]
    fn revocation_skips_owner_and_admins() {
        let (registry, _rx) = setup();
        let frame = Arc::new("bye".to_string());
        assert_eq!(
            recipients(&to_revoked(&registry, &UserId::from("owner"), &frame)),
            vec!["peer"]
        );
    }

    #[test]
    fn broadcast_and_owner_only() {
        let (registry, _rx) = setup();
        let frame = Arc::new("x".to_string());
        assert_eq!(to_all(&registry, &frame).len(), 3);
        let frames = record(false).encode().unwrap();
        assert_eq!(recipients(&to_owner(&registry, &UserId::from("owner"), &frames)), vec!["owner"]);
        assert!(to_owner(&registry, &UserId::from("ghost"), &frames).is_empty());
    }

    #[test]
    fn catch_up_tags_own_record() {
        let mut store = PresenceStore::new();
        let me = UserId::from("me");
        let _ = store.upsert(
            &me,
            "me",
            StateUpdate {
                coordinates: Some(Coordinates { lat: 1.0, lng: 1.0 }),
                ..StateUpdate::default()
            },
        );
        let _ = store.upsert(
            &UserId::from("hidden"),
            "hidden",
            StateUpdate {
                coordinates: Some(Coordinates { lat: 2.0, lng: 2.0 }),
                ..StateUpdate::default()
            },
        );

        let frames = catch_up(&store, &me, false).unwrap();
        assert_eq!(frames.len(), 1);
        let json: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(json["isSelf"], true);

        assert_eq!(catch_up(&store, &UserId::from("admin"), true).unwrap().len(), 2);
    }
}
