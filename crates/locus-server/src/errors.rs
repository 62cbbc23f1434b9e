//! Failure taxonomy of the presence path.
//!
//! None of these are fatal to the process. At worst the offending connection
//! is terminated and its presence record tombstoned.

use locus_core::{ConnectionId, UserId};
use thiserror::Error;

/// A failure local to one connection or one frame.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// An inbound frame could not be understood; it is dropped.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A frame could not be handed to a recipient whose transport is gone.
    #[error("delivery to {user_id} ({connection_id}) failed: connection closed")]
    DeliveryFailure {
        /// Recipient user.
        user_id: UserId,
        /// Recipient connection.
        connection_id: ConnectionId,
    },

    /// A recipient's outbound queue is full; the frame is dropped.
    #[error("outbound queue full for {user_id} ({connection_id})")]
    Backpressure {
        /// Recipient user.
        user_id: UserId,
        /// Recipient connection.
        connection_id: ConnectionId,
    },

    /// A heartbeat probe could not be sent or went unanswered.
    #[error("heartbeat probe failed for {user_id} ({connection_id})")]
    ProbeFailure {
        /// Probed user.
        user_id: UserId,
        /// Probed connection.
        connection_id: ConnectionId,
    },

    /// A new user was refused because the connection limit is reached.
    #[error("connection limit of {max} reached")]
    AtCapacity {
        /// Configured limit.
        max: usize,
    },

    /// The underlying socket reported an error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl PresenceError {
    /// Wrap a JSON parse failure.
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}
