//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use locus_auth::Identity;
use locus_core::{ConnectionId, UserId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::errors::PresenceError;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Serialized JSON text frame.
    Text(Arc<String>),
    /// Heartbeat probe.
    Ping,
}

/// An authenticated, connected client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Owner of the connection.
    pub user_id: UserId,
    /// Owner's display name.
    pub username: String,
    /// Whether the owner sees every location.
    pub is_admin: bool,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<OutboundFrame>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last probe.
    is_alive: AtomicBool,
    /// When the last Pong (or client ping) was received.
    last_pong: Mutex<Instant>,
    /// Count of frames dropped due to a full channel.
    dropped_messages: AtomicU64,
    /// Cancelled when the connection must be torn down.
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a connection for an authenticated identity.
    pub fn new(identity: &Identity, tx: mpsc::Sender<OutboundFrame>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            is_admin: identity.is_admin(),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a text frame.
    ///
    /// A closed channel means the writer is gone and the caller should run
    /// disconnect cleanup. A full channel drops the frame and counts it.
    pub fn send(&self, message: Arc<String>) -> Result<(), PresenceError> {
        self.enqueue(OutboundFrame::Text(message))
    }

    /// Serialize a value and queue it as a text frame.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), PresenceError> {
        let json = serde_json::to_string(value).map_err(PresenceError::malformed)?;
        self.send(Arc::new(json))
    }

    /// Queue a heartbeat probe.
    pub fn ping(&self) -> Result<(), PresenceError> {
        self.enqueue(OutboundFrame::Ping).map_err(|err| match err {
            PresenceError::DeliveryFailure { .. } => PresenceError::ProbeFailure {
                user_id: self.user_id.clone(),
                connection_id: self.id.clone(),
            },
            other => other,
        })
    }

    fn enqueue(&self, frame: OutboundFrame) -> Result<(), PresenceError> {
        if self.is_terminated() {
            return Err(self.delivery_failure());
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(PresenceError::Backpressure {
                    user_id: self.user_id.clone(),
                    connection_id: self.id.clone(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(self.delivery_failure()),
        }
    }

    fn delivery_failure(&self) -> PresenceError {
        PresenceError::DeliveryFailure {
            user_id: self.user_id.clone(),
            connection_id: self.id.clone(),
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Whether a response has been seen since the last probe.
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Ask the session tasks to close the socket. Idempotent.
    pub fn terminate(&self) {
        self.closed.cancel();
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is terminated.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("is_admin", &self.is_admin)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use locus_auth::Role;

    pub(crate) fn identity(user: &str, role: Role) -> Identity {
        Identity {
            user_id: UserId::from(user),
            username: format!("name-{user}"),
            role,
        }
    }

    pub(crate) fn connection(
        user: &str,
        role: Role,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ClientConnection::new(&identity(user, role), tx)), rx)
    }
}
