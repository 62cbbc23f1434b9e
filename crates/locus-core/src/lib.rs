//! # locus-core
//!
//! Foundation types shared by every Locus crate:
//!
//! - **Branded IDs**: [`UserId`] and [`ConnectionId`] newtypes
//! - **Time**: epoch-millisecond timestamps used on the wire
//! - **Logging**: `tracing` subscriber installation

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod time;

pub use ids::{ConnectionId, UserId};
