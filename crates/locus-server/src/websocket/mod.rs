//! WebSocket connection state, session lifecycle, and heartbeat monitoring.

pub mod connection;
pub mod heartbeat;
pub mod session;
