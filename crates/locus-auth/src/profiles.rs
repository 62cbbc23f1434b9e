//! User-profile lookup.
//!
//! The profile store is owned by the account service; the presence server
//! only needs `id → (username, role, tokenVersion)`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use locus_core::UserId;
use parking_lot::RwLock;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AuthError;

/// Role of a user in the account service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Sees every user's location regardless of their visibility setting.
    #[serde(alias = "admin")]
    Admin,
    /// Regular member.
    #[default]
    #[serde(alias = "member")]
    Member,
}

/// The subset of a user profile the presence server needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Profile ID.
    pub id: UserId,
    /// Display name broadcast alongside the user's location.
    pub username: String,
    /// Account role.
    #[serde(default)]
    pub role: Role,
    /// Current revocation counter; bumping it invalidates outstanding tokens.
    #[serde(default = "default_token_version")]
    pub token_version: u64,
}

fn default_token_version() -> u64 {
    1
}

/// Resolves a user ID to its current profile.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    /// Fetch the profile, `Ok(None)` when the user does not exist.
    async fn find_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, AuthError>;
}

/// Profiles held in memory.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl InMemoryProfiles {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `profiles`.
    pub fn from_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let map = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            profiles: RwLock::new(map),
        }
    }

    /// Load a JSON array of profiles from disk.
    pub fn load_from_file(path: &Path) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path)?;
        let profiles: Vec<UserProfile> = serde_json::from_str(&content)?;
        debug!(?path, count = profiles.len(), "loaded profiles from file");
        Ok(Self::from_profiles(profiles))
    }

    /// Insert or replace a profile.
    pub fn insert(&self, profile: UserProfile) {
        let _ = self.profiles.write().insert(profile.id.clone(), profile);
    }

    /// Bump a user's revocation counter, returning the new value.
    pub fn revoke_tokens(&self, user_id: &UserId) -> Option<u64> {
        let mut profiles = self.profiles.write();
        let profile = profiles.get_mut(user_id)?;
        profile.token_version += 1;
        Some(profile.token_version)
    }

    /// Number of stored profiles.
    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    /// Whether no profiles are stored.
    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }
}

#[async_trait]
impl ProfileLookup for InMemoryProfiles {
    async fn find_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, AuthError> {
        Ok(self.profiles.read().get(user_id).cloned())
    }
}

/// Profiles served by the account service at `GET {base}/users/{id}`.
#[derive(Debug, Clone)]
pub struct HttpProfileLookup {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpProfileLookup {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let base_url = Url::parse(base_url).map_err(|e| AuthError::Status {
            status: 0,
            message: format!("invalid profile service URL {base_url:?}: {e}"),
        })?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn profile_url(&self, user_id: &UserId) -> Result<Url, AuthError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| AuthError::Status {
                status: 0,
                message: format!("profile service URL cannot be a base: {}", self.base_url),
            })?;
            let _ = segments.pop_if_empty().push("users").push(user_id.as_str());
        }
        Ok(url)
    }
}

#[async_trait]
impl ProfileLookup for HttpProfileLookup {
    async fn find_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, AuthError> {
        let url = self.profile_url(user_id)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(Some(response.json::<UserProfile>().await?))
    }
}
