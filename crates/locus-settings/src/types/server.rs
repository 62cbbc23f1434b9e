//! Server transport and presence timing settings.

use serde::{Deserialize, Serialize};

/// Network and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Maximum number of concurrently connected users.
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1_000,
            max_message_size: 64 * 1024,
            outbound_buffer: 1_024,
        }
    }
}

/// Presence timing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Interval between liveness probes, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Interval between throttled rebroadcasts of a user's state, in milliseconds.
    pub update_interval_ms: u64,
    /// How long a disconnected user's record is kept before it is purged, in milliseconds.
    pub purge_grace_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            update_interval_ms: 5_000,
            purge_grace_ms: 30_000,
        }
    }
}
