//! Live connections, one per user.

use std::collections::HashMap;
use std::sync::Arc;

use locus_core::{ConnectionId, UserId};

use crate::websocket::connection::ClientConnection;

/// Connected clients indexed by user ID.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<UserId, Arc<ClientConnection>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any existing one for the same user.
    ///
    /// The replaced connection is terminated and returned.
    pub fn register(&mut self, connection: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        let previous = self.connections.insert(connection.user_id.clone(), connection)?;
        previous.terminate();
        Some(previous)
    }

    /// Remove whichever connection is registered for `user_id`.
    pub fn unregister(&mut self, user_id: &UserId) -> Option<Arc<ClientConnection>> {
        self.connections.remove(user_id)
    }

    /// Remove `user_id`'s entry only if it is still `connection_id`.
    ///
    /// Cleanup for a replaced connection must not take down its successor.
    pub fn remove_connection(
        &mut self,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Option<Arc<ClientConnection>> {
        if !self.is_current(user_id, connection_id) {
            return None;
        }
        self.connections.remove(user_id)
    }

    /// Whether `connection_id` is the registered connection for `user_id`.
    pub fn is_current(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        self.connections
            .get(user_id)
            .is_some_and(|c| &c.id == connection_id)
    }

    /// Whether `user_id` has a connection.
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.connections.contains_key(user_id)
    }

    /// The registered connection for `user_id`.
    pub fn get(&self, user_id: &UserId) -> Option<&Arc<ClientConnection>> {
        self.connections.get(user_id)
    }

    /// Every registered connection.
    pub fn all(&self) -> impl Iterator<Item = &Arc<ClientConnection>> {
        self.connections.values()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> Vec<Arc<ClientConnection>> {
        self.connections.drain().map(|(_, c)| c).collect()
    }

    /// Number of connected users.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
