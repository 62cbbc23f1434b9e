//! # locusd
//!
//! Locus presence server binary. Loads settings, wires the authenticator and
//! profile store into the HTTP/WebSocket server, and runs until a shutdown
//! signal arrives.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use locus_auth::{
    ConnectionAuthenticator, HttpProfileLookup, InMemoryProfiles, ProfileLookup, TokenVerifier,
};
use locus_core::logging::{LogFormat, init_subscriber};
use locus_server::config::ServerConfig;
use locus_server::metrics;
use locus_server::server::LocusServer;
use locus_server::shutdown::shutdown_signal;
use locus_settings::LocusSettings;
use tracing::{info, warn};

/// Locus presence server.
#[derive(Parser, Debug)]
#[command(name = "locusd", about = "Locus location presence server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file (default `~/.locus/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// JSON file of user profiles (overrides `auth.profilesPath`).
    #[arg(long)]
    profiles: Option<PathBuf>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(locus_settings::settings_path)
    }

    /// Layer CLI flags over loaded settings.
    fn apply(&self, settings: &mut LocusSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.profiles {
            settings.auth.profiles_path = Some(path.display().to_string());
        }
    }
}

/// Pick the profile store: a local file wins over the remote service.
fn build_profile_lookup(settings: &LocusSettings) -> Result<Arc<dyn ProfileLookup>> {
    if let Some(path) = settings.auth.profiles_path.as_deref() {
        let profiles = InMemoryProfiles::load_from_file(Path::new(path))
            .with_context(|| format!("Failed to load profiles from {path}"))?;
        info!(path, count = profiles.len(), "using profile file");
        return Ok(Arc::new(profiles));
    }
    if let Some(url) = settings.auth.profile_service_url.as_deref() {
        let timeout = Duration::from_millis(settings.auth.lookup_timeout_ms);
        let lookup = HttpProfileLookup::new(url, timeout)
            .with_context(|| format!("Invalid profile service URL {url}"))?;
        info!(url, "using profile service");
        return Ok(Arc::new(lookup));
    }
    bail!("no profile source configured: set auth.profileServiceUrl or auth.profilesPath")
}

fn build_authenticator(settings: &LocusSettings) -> Result<ConnectionAuthenticator> {
    let Some(secret) = settings.auth.jwt_secret.as_deref() else {
        bail!("auth.jwtSecret must be set");
    };
    let profiles = build_profile_lookup(settings)?;
    Ok(ConnectionAuthenticator::new(TokenVerifier::new(secret), profiles))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings_path();
    let mut settings = locus_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);

    init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );

    settings.validate().context("Invalid settings")?;
    let authenticator = Arc::new(build_authenticator(&settings)?);

    let prometheus = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed; /metrics disabled");
            None
        }
    };

    let config = ServerConfig::from_settings(&settings);
    let server = LocusServer::new(config, authenticator, prometheus);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(%addr, "locusd listening");

    match shutdown_signal().await {
        Ok(signal) => info!(signal, "shutdown signal received"),
        Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
    }

    server.shutdown().shutdown();
    let _ = handle.await;
    info!("locusd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["locusd"]);
        assert_eq!(cli.host, None);
        assert_eq!(cli.port, None);

        let mut settings = LocusSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.auth.profiles_path, None);
    }

    #[test]
    fn cli_overrides_host_and_port() {
        let cli = Cli::parse_from(["locusd", "--host", "127.0.0.1", "--port", "9000"]);
        let mut settings = LocusSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
    }

    #[test]
    fn cli_profiles_override_settings() {
        let cli = Cli::parse_from(["locusd", "--profiles", "/tmp/people.json"]);
        let mut settings = LocusSettings::default();
        settings.auth.profiles_path = Some("/etc/locus/profiles.json".into());
        cli.apply(&mut settings);
        assert_eq!(settings.auth.profiles_path.as_deref(), Some("/tmp/people.json"));
    }

    #[test]
    fn settings_path_defaults_under_locus_dir() {
        let cli = Cli::parse_from(["locusd"]);
        let path = cli.settings_path();
        assert!(path.to_string_lossy().contains(".locus"));
        assert!(path.to_string_lossy().ends_with("settings.json"));

        let cli = Cli::parse_from(["locusd", "--settings", "/tmp/custom.json"]);
        assert_eq!(cli.settings_path(), PathBuf::from("/tmp/custom.json"));
    }

    #[test]
    fn profile_file_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(
            &path,
            r#"[{"id":"u1","username":"ann","role":"member","tokenVersion":0}]"#,
        )
        .unwrap();

        let mut settings = LocusSettings::default();
        settings.auth.profiles_path = Some(path.display().to_string());
        settings.auth.profile_service_url = Some("http://profiles.invalid".into());
        assert!(build_profile_lookup(&settings).is_ok());
    }

    #[test]
    fn missing_profile_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = LocusSettings::default();
        settings.auth.profiles_path = Some(dir.path().join("absent.json").display().to_string());
        let err = build_profile_lookup(&settings).err().unwrap();
        assert!(err.to_string().contains("Failed to load profiles"));
    }

    #[test]
    fn profile_service_used_without_file() {
        let mut settings = LocusSettings::default();
        settings.auth.profile_service_url = Some("http://127.0.0.1:9/".into());
        assert!(build_profile_lookup(&settings).is_ok());
    }

    #[test]
    fn no_profile_source_is_an_error() {
        let settings = LocusSettings::default();
        let err = build_profile_lookup(&settings).err().unwrap();
        assert!(err.to_string().contains("no profile source"));
    }

    #[test]
    fn authenticator_requires_secret() {
        let mut settings = LocusSettings::default();
        settings.auth.profile_service_url = Some("http://127.0.0.1:9/".into());
        assert!(build_authenticator(&settings).is_err());

        settings.auth.jwt_secret = Some("s3cret".into());
        assert!(build_authenticator(&settings).is_ok());
    }
}
