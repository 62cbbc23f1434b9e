//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::presence::PresenceStatus;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Presence hub counters.
    pub websocket: PresenceStatus,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, websocket: PresenceStatus) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: websocket.connections,
        websocket,
    }
}
