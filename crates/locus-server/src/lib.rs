//! # locus-server
//!
//! Axum HTTP + `WebSocket` presence server.
//!
//! - `GET /ws` upgrade, authenticated before the socket exists
//! - [`presence::PresenceHub`] owning the connection registry, presence store,
//!   and throttled-update scheduler
//! - Visibility-filtered fan-out with self echo
//! - Heartbeat ping/pong liveness monitoring
//! - `GET /ws-status`, `GET /health`, `GET /metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod websocket;
