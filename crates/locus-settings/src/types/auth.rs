//! Handshake authentication settings.

use serde::{Deserialize, Serialize};

/// Where tokens are verified and profiles resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Base URL of the user-profile service (`GET {url}/users/{id}`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_service_url: Option<String>,
    /// JSON file of profiles used when no profile service is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles_path: Option<String>,
    /// Timeout for a single profile lookup, in milliseconds.
    pub lookup_timeout_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            profile_service_url: None,
            profiles_path: None,
            lookup_timeout_ms: 5_000,
        }
    }
}
