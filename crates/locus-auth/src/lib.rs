//! # locus-auth
//!
//! Authenticates WebSocket upgrade requests before a socket exists.
//!
//! - [`TokenVerifier`] checks the HS256 signature and expiry of a bearer token
//! - [`ProfileLookup`] resolves the token's user against the profile store
//!   ([`HttpProfileLookup`] for a remote service, [`InMemoryProfiles`] for
//!   local runs and tests)
//! - [`ConnectionAuthenticator`] combines both and enforces the revocation
//!   counter (`tokenVersion`)

#![deny(unsafe_code)]

pub mod authenticator;
pub mod errors;
pub mod profiles;
pub mod token;

pub use authenticator::{ConnectionAuthenticator, Identity};
pub use errors::{AuthError, AuthRejection};
pub use profiles::{HttpProfileLookup, InMemoryProfiles, ProfileLookup, Role, UserProfile};
pub use token::{Claims, TokenVerifier};
