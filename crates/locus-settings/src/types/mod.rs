//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may contain any subset of fields.

mod auth;
mod logging;
mod server;

pub use auth::*;
pub use logging::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "presence": { "updateIntervalMs": 2000 },
///   "auth": { "jwtSecret": "change-me" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocusSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Network and transport settings.
    pub server: ServerSettings,
    /// Presence timing settings.
    pub presence: PresenceSettings,
    /// Handshake authentication settings.
    pub auth: AuthSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl Default for LocusSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "locus".to_string(),
            server: ServerSettings::default(),
            presence: PresenceSettings::default(),
            auth: AuthSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl LocusSettings {
    /// Check cross-field constraints that serde defaults cannot express.
    ///
    /// A server without a JWT secret would have to accept anonymous
    /// connections, so a missing secret is a hard error.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.as_deref().is_none_or(str::is_empty) {
            return Err(SettingsError::InvalidValue(
                "auth.jwtSecret must be set".to_string(),
            ));
        }
        if self.presence.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "presence.heartbeatIntervalMs must be positive".to_string(),
            ));
        }
        if self.presence.update_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "presence.updateIntervalMs must be positive".to_string(),
            ));
        }
        if self.server.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundBuffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> LocusSettings {
        let mut settings = LocusSettings::default();
        settings.auth.jwt_secret = Some("s3cret".to_string());
        settings
    }

    #[test]
    fn validate_accepts_secret() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_secret() {
        let mut settings = valid();
        settings.auth.jwt_secret = Some(String::new());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("jwtSecret"));
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut settings = valid();
        settings.presence.update_interval_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.presence.heartbeat_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"server": {"port": 9999}}"#;
        let settings: LocusSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.server.port, 9999);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.presence.update_interval_ms, 5_000);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(LocusSettings::default()).unwrap();
        assert!(json["presence"]["heartbeatIntervalMs"].is_number());
        assert!(json["server"]["maxMessageSize"].is_number());
    }
}
