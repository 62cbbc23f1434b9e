//! The presence hub.
//!
//! One instance owns every piece of mutable presence state (registry,
//! store, scheduler) behind a single lock. Frames are computed while the
//! lock is held and delivered after it is released; deliveries only enqueue
//! onto bounded per-connection channels, so no await ever happens under the
//! lock.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use locus_auth::Identity;
use locus_core::time::now_millis;
use locus_core::{ConnectionId, UserId};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::record::{
    ActionFrame, ClientMessage, DisconnectNotice, EncodedFrames, PONG_FRAME, PresenceRecord,
    StateUpdate,
};
use super::registry::ConnectionRegistry;
use super::router::{self, Delivery};
use super::scheduler::{self, Scheduled, UpdateScheduler};
use super::store::PresenceStore;
use super::topics::TopicRegistry;
use crate::config::PresenceConfig;
use crate::errors::PresenceError;
use crate::metrics::{
    HEARTBEAT_TERMINATIONS_TOTAL, PRESENCE_BROADCASTS_TOTAL, PRESENCE_PURGES_TOTAL,
    PRESENCE_SCHEDULED_FLUSHES_TOTAL, WS_BROADCAST_DROPS_TOTAL, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_EVICTIONS_TOTAL,
};
use crate::websocket::connection::{ClientConnection, OutboundFrame};

/// Lifetime frame drops after which a slow client is disconnected.
const MAX_TOTAL_DROPS: u64 = 100;

/// Why a connection is being cleaned up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent `{type: "disconnect"}`.
    ClientRequest,
    /// The socket closed.
    ConnectionClosed,
    /// The socket errored.
    TransportError,
    /// No pong since the previous heartbeat tick.
    HeartbeatTimeout,
    /// A frame could not be handed to the connection.
    DeliveryFailure,
}

impl DisconnectReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::ConnectionClosed => "closed",
            Self::TransportError => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::DeliveryFailure => "delivery_failure",
        }
    }
}

/// Snapshot of hub counters served on `/ws-status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    /// Always `"active"`.
    pub status: &'static str,
    /// Connected users.
    pub connections: usize,
    /// Live records with a location.
    pub active_sharing_users: usize,
    /// Live public records with a location.
    pub public_sharing_users: usize,
    /// Throttled rebroadcasts pending.
    pub pending_updates: usize,
    /// Tombstones awaiting purge.
    pub pending_purges: usize,
    /// Signaling topics with at least one subscriber.
    pub topics: usize,
    /// Seconds since the hub was created.
    pub uptime_secs: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Report,
    Visibility,
}

struct HubState {
    registry: ConnectionRegistry,
    store: PresenceStore,
    scheduler: UpdateScheduler,
    topics: TopicRegistry,
}

/// A registered connection and the records it must be shown first.
#[derive(Debug)]
pub struct Connected {
    /// The new connection.
    pub connection: Arc<ClientConnection>,
    /// Encoded catch-up snapshot, to be written before any queued frame.
    pub catch_up: Vec<Arc<String>>,
}

/// Owns all presence state and routes every inbound frame.
pub struct PresenceHub {
    state: Mutex<HubState>,
    config: PresenceConfig,
    started_at: Instant,
    this: Weak<PresenceHub>,
}

impl PresenceHub {
    /// Create a hub. Timers it spawns hold only a weak reference.
    pub fn new(config: PresenceConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(HubState {
                registry: ConnectionRegistry::new(),
                store: PresenceStore::new(),
                scheduler: UpdateScheduler::new(),
                topics: TopicRegistry::new(),
            }),
            config,
            started_at: Instant::now(),
            this: this.clone(),
        })
    }

    /// Timing configuration.
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Whether a connection for `user_id` fits under `max_connections`.
    ///
    /// A user who is already connected is always admitted; the new
    /// connection replaces the old one.
    pub fn has_capacity_for(&self, user_id: &UserId, max_connections: usize) -> bool {
        let state = self.state.lock();
        state.registry.contains(user_id) || state.registry.len() < max_connections
    }

    /// Register an authenticated connection and build the catch-up
    /// snapshot of every record it may see.
    ///
    /// The snapshot is returned rather than queued so its size is not bounded
    /// by the outbound channel. Fails when a new user would exceed
    /// `max_connections`; the check and the registration share one lock.
    pub fn connect(
        &self,
        identity: &Identity,
        tx: mpsc::Sender<OutboundFrame>,
        max_connections: usize,
    ) -> Result<Connected, PresenceError> {
        let connection = Arc::new(ClientConnection::new(identity, tx));
        let (evicted, catch_up, active) = {
            let mut state = self.state.lock();
            if !state.registry.contains(&connection.user_id) && state.registry.len() >= max_connections {
                return Err(PresenceError::AtCapacity { max: max_connections });
            }
            let evicted = state.registry.register(Arc::clone(&connection));
            if let Some(old) = &evicted {
                let _ = state.scheduler.cancel(&connection.user_id);
                let _ = state.topics.remove_connection(&old.id);
            }
            let catch_up = router::catch_up(&state.store, &connection.user_id, connection.is_admin);
            (evicted, catch_up, state.registry.len())
        };

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(as_gauge(active));
        if let Some(old) = evicted {
            counter!(WS_EVICTIONS_TOTAL).increment(1);
            info!(
                user_id = %connection.user_id,
                old_connection = %old.id,
                new_connection = %connection.id,
                "replaced existing connection"
            );
        } else {
            info!(user_id = %connection.user_id, conn_id = %connection.id, admin = connection.is_admin, "user connected");
        }

        let catch_up = catch_up.unwrap_or_else(|error| {
            warn!(conn_id = %connection.id, %error, "failed to encode catch-up snapshot");
            Vec::new()
        });
        debug!(conn_id = %connection.id, records = catch_up.len(), "built catch-up snapshot");
        Ok(Connected { connection, catch_up })
    }

    /// Handle one inbound text frame.
    ///
    /// Malformed frames are returned as errors and change nothing.
    pub fn handle_text(&self, connection: &Arc<ClientConnection>, text: &str) -> Result<(), PresenceError> {
        match ClientMessage::parse(text)? {
            ClientMessage::Disconnect => {
                let _ = self.disconnect(&connection.user_id, &connection.id, DisconnectReason::ClientRequest);
            }
            ClientMessage::Ping => {
                connection.mark_alive();
                if let Err(error) = connection.send(Arc::new(PONG_FRAME.to_string())) {
                    debug!(conn_id = %connection.id, %error, "pong not delivered");
                }
            }
            ClientMessage::Visibility {
                show_location_to_everyone,
            } => {
                let update = StateUpdate {
                    show_location_to_everyone: Some(show_location_to_everyone),
                    ..StateUpdate::default()
                };
                self.apply_update(connection, update, UpdateKind::Visibility);
            }
            ClientMessage::Action { payload } => self.relay_action(connection, &payload),
            ClientMessage::Subscribe { topics } => {
                let mut state = self.state.lock();
                if state.registry.is_current(&connection.user_id, &connection.id) {
                    let added = state.topics.subscribe(connection, topics);
                    debug!(conn_id = %connection.id, added, "subscribed to topics");
                }
            }
            ClientMessage::Unsubscribe { topics } => {
                let removed = self
                    .state
                    .lock()
                    .topics
                    .unsubscribe(&connection.id, topics.iter().map(String::as_str));
                debug!(conn_id = %connection.id, removed, "unsubscribed from topics");
            }
            ClientMessage::Publish { topic, message } => self.publish(connection, &topic, message),
            ClientMessage::Update(update) => self.apply_update(connection, update, UpdateKind::Report),
        }
        Ok(())
    }

    fn apply_update(&self, connection: &ClientConnection, update: StateUpdate, kind: UpdateKind) {
        let immediate = update.immediate;
        let (deliveries, started) = {
            let mut state = self.state.lock();
            if !state.registry.is_current(&connection.user_id, &connection.id) {
                debug!(conn_id = %connection.id, "ignoring update from replaced connection");
                return;
            }
            let upserted = state.store.upsert(&connection.user_id, &connection.username, update);
            let record = &upserted.record;
            let frames = match record.encode() {
                Ok(frames) => frames,
                Err(error) => {
                    warn!(user_id = %record.user_id, %error, "failed to encode record");
                    return;
                }
            };

            let mut deliveries = Vec::new();
            let mut started = None;
            if upserted.visibility_changed() {
                if upserted.previous_visibility {
                    match revocation_frame(record) {
                        Ok(frame) => deliveries.extend(router::to_revoked(&state.registry, &record.user_id, &frame)),
                        Err(error) => warn!(user_id = %record.user_id, %error, "failed to encode revocation"),
                    }
                }
                if record.has_location() {
                    deliveries.extend(router::record_to_visible(&state.registry, record, &frames));
                } else {
                    deliveries.extend(router::to_owner(&state.registry, &record.user_id, &frames));
                }
                info!(
                    user_id = %record.user_id,
                    public = record.show_location_to_everyone,
                    "visibility changed"
                );
            } else if immediate {
                deliveries.extend(router::record_to_visible(&state.registry, record, &frames));
            } else if kind == UpdateKind::Visibility {
                deliveries.extend(router::to_owner(&state.registry, &record.user_id, &frames));
            } else if let Scheduled::Started { generation, cancel } = state.scheduler.schedule(&record.user_id) {
                started = Some((generation, cancel));
            }
            (deliveries, started)
        };

        if let Some((generation, cancel)) = started {
            self.spawn_scheduled(connection.user_id.clone(), generation, cancel);
        }
        self.deliver_and_cleanup(deliveries, "record");
    }

    fn relay_action(&self, connection: &ClientConnection, payload: &Map<String, Value>) {
        let deliveries = {
            let mut state = self.state.lock();
            if !state.registry.is_current(&connection.user_id, &connection.id) {
                return;
            }
            let timestamp = state.store.touch(&connection.user_id).unwrap_or_else(now_millis);
            let public = state
                .store
                .get(&connection.user_id)
                .is_some_and(|r| r.show_location_to_everyone);
            let frames = match encode_action(connection, timestamp, payload) {
                Ok(frames) => frames,
                Err(error) => {
                    warn!(user_id = %connection.user_id, %error, "failed to encode action");
                    return;
                }
            };
            router::to_visible(&state.registry, &connection.user_id, public, &frames)
        };
        self.deliver_and_cleanup(deliveries, "action");
    }

    /// Relay a signaling frame to every subscriber of `topic`, stamped with
    /// the subscriber count. The sender need not be subscribed.
    fn publish(&self, connection: &ClientConnection, topic: &str, mut message: Map<String, Value>) {
        let receivers = {
            let state = self.state.lock();
            if !state.registry.is_current(&connection.user_id, &connection.id) {
                return;
            }
            state.topics.subscribers(topic)
        };
        if receivers.is_empty() {
            debug!(conn_id = %connection.id, topic, "publish to topic without subscribers");
            return;
        }
        let _ = message.insert("clients".to_string(), Value::from(receivers.len()));
        let frame = match serde_json::to_string(&message) {
            Ok(json) => Arc::new(json),
            Err(error) => {
                warn!(conn_id = %connection.id, %error, "failed to encode publish frame");
                return;
            }
        };
        debug!(topic, clients = receivers.len(), "published to topic");
        let deliveries = receivers
            .into_iter()
            .map(|receiver| Delivery {
                connection: receiver,
                frame: Arc::clone(&frame),
            })
            .collect();
        self.deliver_and_cleanup(deliveries, "publish");
    }

    /// Rebroadcast the current record of `user_id` for a throttled timer.
    ///
    /// Returns `false` once the timer should stop: the entry was cancelled
    /// or superseded, or the user is gone.
    pub fn flush_scheduled(&self, user_id: &UserId, generation: u64) -> bool {
        let deliveries = {
            let mut state = self.state.lock();
            if !state.scheduler.is_current(user_id, generation) {
                return false;
            }
            let live = state
                .registry
                .contains(user_id)
                .then(|| state.store.get(user_id))
                .flatten()
                .filter(|r| !r.is_disconnected)
                .cloned();
            let Some(record) = live else {
                let _ = state.scheduler.cancel(user_id);
                return false;
            };
            let frames = match record.encode() {
                Ok(frames) => frames,
                Err(error) => {
                    warn!(%user_id, %error, "failed to encode scheduled record");
                    return true;
                }
            };
            router::record_to_visible(&state.registry, &record, &frames)
        };
        counter!(PRESENCE_SCHEDULED_FLUSHES_TOTAL).increment(1);
        self.deliver_and_cleanup(deliveries, "scheduled");
        true
    }

    /// Clean up one connection: unregister it, cancel its pending update,
    /// tombstone its record, and tell everyone it left.
    ///
    /// Keyed by connection so that cleanup of a replaced connection is a
    /// no-op. Recipients whose delivery fails are cleaned up in turn from a
    /// worklist. Returns whether `connection_id` was still registered.
    pub fn disconnect(&self, user_id: &UserId, connection_id: &ConnectionId, reason: DisconnectReason) -> bool {
        let mut worklist = VecDeque::from([(user_id.clone(), connection_id.clone(), reason)]);
        let mut removed_requested = false;
        let mut first = true;

        while let Some((user_id, connection_id, reason)) = worklist.pop_front() {
            let requested = std::mem::take(&mut first);
            let (connection, deliveries, purge, active) = {
                let mut state = self.state.lock();
                let Some(connection) = state.registry.remove_connection(&user_id, &connection_id) else {
                    continue;
                };
                let _ = state.scheduler.cancel(&user_id);
                let _ = state.topics.remove_connection(&connection_id);
                let purge = state.store.tombstone(&user_id);
                let timestamp = state
                    .store
                    .get(&user_id)
                    .and_then(|r| r.disconnected_at)
                    .unwrap_or_else(now_millis);
                let notice = DisconnectNotice::new(user_id.clone(), connection.username.clone(), timestamp);
                let deliveries = match serde_json::to_string(&notice) {
                    Ok(json) => router::to_all(&state.registry, &Arc::new(json)),
                    Err(error) => {
                        warn!(%user_id, %error, "failed to encode disconnect notice");
                        Vec::new()
                    }
                };
                (connection, deliveries, purge, state.registry.len())
            };

            connection.terminate();
            removed_requested |= requested;
            counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).set(as_gauge(active));
            info!(
                %user_id,
                conn_id = %connection_id,
                reason = reason.as_str(),
                age_secs = connection.age().as_secs(),
                dropped = connection.drop_count(),
                "user disconnected"
            );

            if let Some(purge) = purge {
                self.spawn_purge(user_id.clone(), purge.generation, purge.cancel);
            }
            for failed in deliver(deliveries, "disconnect") {
                worklist.push_back((failed.user_id.clone(), failed.id.clone(), DisconnectReason::DeliveryFailure));
            }
        }
        removed_requested
    }

    /// One heartbeat pass over every connection.
    ///
    /// A connection that has not answered since the previous pass, or whose
    /// probe cannot be queued because its channel is closed, is terminated
    /// and cleaned up. Returns the number of connections terminated.
    pub fn heartbeat_tick(&self) -> usize {
        let connections: Vec<Arc<ClientConnection>> = self.state.lock().registry.all().cloned().collect();
        let mut terminated = 0;
        for connection in connections {
            let probe = if connection.check_alive() {
                connection.ping()
            } else {
                Err(PresenceError::ProbeFailure {
                    user_id: connection.user_id.clone(),
                    connection_id: connection.id.clone(),
                })
            };
            match probe {
                Ok(()) => {}
                Err(PresenceError::Backpressure { .. }) => {
                    warn!(conn_id = %connection.id, "heartbeat probe dropped (channel full)");
                }
                Err(error) => {
                    warn!(
                        conn_id = %connection.id,
                        since_pong_ms = u64::try_from(connection.last_pong_elapsed().as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "terminating unresponsive connection"
                    );
                    connection.terminate();
                    if self.disconnect(&connection.user_id, &connection.id, DisconnectReason::HeartbeatTimeout) {
                        terminated += 1;
                        counter!(HEARTBEAT_TERMINATIONS_TOTAL).increment(1);
                    }
                }
            }
        }
        terminated
    }

    /// Remove a tombstoned record if its grace period is still the current one.
    pub fn purge_tombstone(&self, user_id: &UserId, generation: u64) -> bool {
        let purged = self.state.lock().store.purge(user_id, generation);
        if purged {
            counter!(PRESENCE_PURGES_TOTAL).increment(1);
            debug!(%user_id, "purged disconnected record");
        }
        purged
    }

    /// Current counters.
    pub fn status(&self) -> PresenceStatus {
        let state = self.state.lock();
        PresenceStatus {
            status: "active",
            connections: state.registry.len(),
            active_sharing_users: state.store.sharing_count(),
            public_sharing_users: state.store.public_count(),
            pending_updates: state.scheduler.len(),
            pending_purges: state.store.pending_purges(),
            topics: state.topics.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Number of connected users.
    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// The stored record of `user_id`.
    pub fn record(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.state.lock().store.get(user_id).cloned()
    }

    /// The registered connection of `user_id`.
    pub fn connection(&self, user_id: &UserId) -> Option<Arc<ClientConnection>> {
        self.state.lock().registry.get(user_id).cloned()
    }

    /// Stop every timer, drop all state, and terminate every connection.
    ///
    /// No disconnect notices are sent.
    pub fn shutdown(&self) {
        let connections = {
            let mut state = self.state.lock();
            state.scheduler.cancel_all();
            state.topics.clear();
            state.store.clear();
            state.registry.drain()
        };
        let count = connections.len();
        for connection in connections {
            connection.terminate();
        }
        gauge!(WS_CONNECTIONS_ACTIVE).set(0.0);
        info!(connections = count, "presence hub shut down");
    }

    fn spawn_scheduled(&self, user_id: UserId, generation: u64, cancel: CancellationToken) {
        let hub = self.this.clone();
        let _ = tokio::spawn(scheduler::run_repeating(
            self.config.update_interval(),
            cancel,
            move || {
                hub.upgrade()
                    .is_some_and(|hub| hub.flush_scheduled(&user_id, generation))
            },
        ));
    }

    fn spawn_purge(&self, user_id: UserId, generation: u64, cancel: CancellationToken) {
        let hub = self.this.clone();
        let _ = tokio::spawn(scheduler::run_once(self.config.purge_grace(), cancel, move || {
            if let Some(hub) = hub.upgrade() {
                let _ = hub.purge_tombstone(&user_id, generation);
            }
        }));
    }

    fn deliver_and_cleanup(&self, deliveries: Vec<Delivery>, kind: &'static str) {
        for connection in deliver(deliveries, kind) {
            let _ = self.disconnect(&connection.user_id, &connection.id, DisconnectReason::DeliveryFailure);
        }
    }
}

/// Hand frames to their recipients. Returns recipients that must be
/// cleaned up.
fn deliver(deliveries: Vec<Delivery>, kind: &'static str) -> Vec<Arc<ClientConnection>> {
    let mut failed = Vec::new();
    let mut sent = 0u64;
    for Delivery { connection, frame } in deliveries {
        match connection.send(frame) {
            Ok(()) => sent += 1,
            Err(PresenceError::Backpressure { .. }) => {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                let drops = connection.drop_count();
                if drops >= MAX_TOTAL_DROPS {
                    warn!(conn_id = %connection.id, drops, "disconnecting slow client");
                    failed.push(connection);
                } else {
                    warn!(conn_id = %connection.id, total_drops = drops, kind, "frame dropped (channel full)");
                }
            }
            Err(error) => {
                debug!(conn_id = %connection.id, %error, kind, "delivery failed");
                failed.push(connection);
            }
        }
    }
    counter!(PRESENCE_BROADCASTS_TOTAL, "kind" => kind).increment(sent);
    failed
}

#[allow(clippy::cast_precision_loss)]
fn as_gauge(count: usize) -> f64 {
    count as f64
}

fn revocation_frame(record: &PresenceRecord) -> Result<Arc<String>, serde_json::Error> {
    let notice = DisconnectNotice::new(record.user_id.clone(), record.username.clone(), record.timestamp);
    Ok(Arc::new(serde_json::to_string(&notice)?))
}

fn encode_action(
    connection: &ClientConnection,
    timestamp: i64,
    payload: &Map<String, Value>,
) -> Result<EncodedFrames, serde_json::Error> {
    let frame = |is_self| ActionFrame {
        user_id: &connection.user_id,
        username: &connection.username,
        kind: "action",
        timestamp,
        is_self,
        payload,
    };
    Ok(EncodedFrames {
        for_others: Arc::new(serde_json::to_string(&frame(false))?),
        for_owner: Arc::new(serde_json::to_string(&frame(true))?),
    })
}
