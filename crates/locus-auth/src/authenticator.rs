//! Handshake authentication.

use std::sync::Arc;

use locus_core::UserId;
use tracing::debug;

use crate::errors::AuthRejection;
use crate::profiles::{ProfileLookup, Role};
use crate::token::TokenVerifier;

/// An authenticated user, fixed for the lifetime of its connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Profile ID.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Account role.
    pub role: Role,
}

impl Identity {
    /// Whether this user sees every location.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Verifies a bearer credential and resolves it to an [`Identity`].
pub struct ConnectionAuthenticator {
    verifier: TokenVerifier,
    profiles: Arc<dyn ProfileLookup>,
}

impl ConnectionAuthenticator {
    /// Create an authenticator from its two collaborators.
    pub fn new(verifier: TokenVerifier, profiles: Arc<dyn ProfileLookup>) -> Self {
        Self { verifier, profiles }
    }

    /// The token verifier in use.
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Authenticate an upgrade request's credential.
    ///
    /// Fails closed: any error from the profile store is a rejection.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthRejection> {
        let token = credential.ok_or(AuthRejection::Missing)?;
        let claims = self.verifier.verify(token)?;

        let profile = self
            .profiles
            .find_profile(&claims.id)
            .await?
            .ok_or_else(|| AuthRejection::ProfileNotFound(claims.id.clone()))?;

        if profile.token_version != claims.token_version {
            return Err(AuthRejection::Revoked {
                user_id: claims.id,
                presented: claims.token_version,
                current: profile.token_version,
            });
        }

        debug!(user_id = %profile.id, role = ?profile.role, "credential accepted");
        Ok(Identity {
            user_id: profile.id,
            username: profile.username,
            role: profile.role,
        })
    }
}
