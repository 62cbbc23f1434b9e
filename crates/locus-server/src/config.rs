//! Server configuration.

use std::time::Duration;

use locus_settings::LocusSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the presence server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum number of concurrently connected users.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Presence timing.
    pub presence: PresenceConfig,
}

/// Timing knobs of the presence hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Heartbeat probe interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Throttled rebroadcast interval in milliseconds.
    pub update_interval_ms: u64,
    /// Tombstone grace period in milliseconds.
    pub purge_grace_ms: u64,
}

impl PresenceConfig {
    /// Heartbeat probe interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Throttled rebroadcast interval.
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Tombstone grace period.
    pub fn purge_grace(&self) -> Duration {
        Duration::from_millis(self.purge_grace_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            update_interval_ms: 5_000,
            purge_grace_ms: 30_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1_000,
            max_message_size: 64 * 1024,
            outbound_buffer: 1_024,
            presence: PresenceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &LocusSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            outbound_buffer: settings.server.outbound_buffer,
            presence: PresenceConfig {
                heartbeat_interval_ms: settings.presence.heartbeat_interval_ms,
                update_interval_ms: settings.presence.update_interval_ms,
                purge_grace_ms: settings.presence.purge_grace_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.presence.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.presence.purge_grace(), Duration::from_secs(30));
        assert_eq!(cfg.presence.update_interval(), Duration::from_secs(5));
    }

    #[test]
    fn from_settings_copies_values() {
        let mut settings = LocusSettings::default();
        settings.server.port = 4000;
        settings.server.outbound_buffer = 16;
        settings.presence.update_interval_ms = 750;
        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.outbound_buffer, 16);
        assert_eq!(cfg.presence.update_interval(), Duration::from_millis(750));
        assert_eq!(cfg.host, "0.0.0.0");
    }
}
