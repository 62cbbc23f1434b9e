//! Auth error types.

use locus_core::UserId;

/// Failures talking to the profile store.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The profile service answered with an unexpected status.
    #[error("profile service error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or description.
        message: String,
    },
}

/// Why a handshake was refused.
///
/// Every variant maps to HTTP 401 at the upgrade endpoint.
#[derive(Debug, thiserror::Error)]
pub enum AuthRejection {
    /// No credential was supplied.
    #[error("missing credential")]
    Missing,

    /// The credential is not a well-formed token.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// Signature check failed or the token has expired.
    #[error("invalid or expired credential: {0}")]
    Invalid(String),

    /// The token names a user the profile store does not know.
    #[error("profile not found: {0}")]
    ProfileNotFound(UserId),

    /// The token's revocation counter no longer matches the profile.
    #[error("credential revoked for {user_id} (token version {presented}, current {current})")]
    Revoked {
        /// User the token was issued to.
        user_id: UserId,
        /// Counter embedded in the token.
        presented: u64,
        /// Counter currently on the profile.
        current: u64,
    },

    /// The profile store could not be consulted.
    #[error("profile lookup failed: {0}")]
    LookupFailed(#[from] AuthError),
}

impl AuthRejection {
    /// Short machine-readable reason, used as a log field and metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed(_) => "malformed",
            Self::Invalid(_) => "invalid",
            Self::ProfileNotFound(_) => "profile-not-found",
            Self::Revoked { .. } => "revoked",
            Self::LookupFailed(_) => "lookup-failed",
        }
    }
}
