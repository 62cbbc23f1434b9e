//! Presence state and routing.
//!
//! [`PresenceHub`] is the entry point; the other modules are the pieces it
//! owns and are public so they can be exercised on their own.

pub mod hub;
pub mod record;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod topics;

pub use hub::{Connected, DisconnectReason, PresenceHub, PresenceStatus};
pub use record::{ClientMessage, DisconnectNotice, PresenceRecord, StateUpdate};
