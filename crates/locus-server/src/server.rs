//! `LocusServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use locus_auth::ConnectionAuthenticator;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::{WS_AUTH_REJECTIONS_TOTAL, render};
use crate::presence::{PresenceHub, PresenceStatus};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::heartbeat::run_heartbeat_monitor;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Presence hub.
    pub hub: Arc<PresenceHub>,
    /// Upgrade-time authentication.
    pub authenticator: Arc<ConnectionAuthenticator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The presence server.
pub struct LocusServer {
    config: Arc<ServerConfig>,
    hub: Arc<PresenceHub>,
    authenticator: Arc<ConnectionAuthenticator>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl LocusServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<ConnectionAuthenticator>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let hub = PresenceHub::new(config.presence);
        Self {
            config: Arc::new(config),
            hub,
            authenticator,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            authenticator: Arc::clone(&self.authenticator),
            config: Arc::clone(&self.config),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/ws-status", get(ws_status_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind, then serve in the background until shutdown is requested.
    ///
    /// Also starts the heartbeat monitor. The returned handle resolves once
    /// the HTTP server and the monitor have both stopped.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "presence server listening");

        let token = self.shutdown.token();
        let heartbeat = tokio::spawn(run_heartbeat_monitor(
            Arc::clone(&self.hub),
            self.config.presence.heartbeat_interval(),
            token.clone(),
        ));

        let hub = Arc::clone(&self.hub);
        let app = self.router();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
                hub.shutdown();
            });
            if let Err(error) = serve.await {
                warn!(%error, "http server exited with error");
            }
            let _ = heartbeat.await;
            info!("presence server stopped");
        });

        Ok((addr, handle))
    }

    /// The presence hub.
    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Token from the query string, or else the first `Sec-WebSocket-Protocol`
/// entry. The flag says whether the subprotocol must be echoed back.
fn extract_credential(params: &WsParams, headers: &HeaderMap) -> (Option<String>, bool) {
    if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
        return (Some(token.to_string()), false);
    }
    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').map(str::trim).find(|p| !p.is_empty()))
        .map(str::to_string);
    let via_protocol = protocol.is_some();
    (protocol, via_protocol)
}

/// GET /ws
///
/// The credential is checked before the upgrade is accepted; a rejected
/// handshake never creates a socket.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (credential, via_protocol) = extract_credential(&params, &headers);
    let identity = match state.authenticator.authenticate(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(rejection) => {
            counter!(WS_AUTH_REJECTIONS_TOTAL, "reason" => rejection.reason()).increment(1);
            warn!(reason = rejection.reason(), error = %rejection, "rejected websocket handshake");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    if !state.hub.has_capacity_for(&identity.user_id, state.config.max_connections) {
        warn!(user_id = %identity.user_id, max = state.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let upgrade = match credential {
        Some(token) if via_protocol => upgrade.protocols([token]),
        _ => upgrade,
    };
    let hub = Arc::clone(&state.hub);
    let buffer = state.config.outbound_buffer;
    let max_connections = state.config.max_connections;
    upgrade
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, identity, hub, buffer, max_connections))
}

/// GET /ws-status
async fn ws_status_handler(State(state): State<AppState>) -> Json<PresenceStatus> {
    Json(state.hub.status())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.hub.status()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use locus_auth::{InMemoryProfiles, Role, TokenVerifier, UserProfile};
    use locus_core::UserId;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "server-test-secret";

    fn authenticator() -> Arc<ConnectionAuthenticator> {
        let profiles = InMemoryProfiles::from_profiles([UserProfile {
            id: UserId::from("u1"),
            username: "ann".into(),
            role: Role::Member,
            token_version: 1,
        }]);
        Arc::new(ConnectionAuthenticator::new(TokenVerifier::new(SECRET), Arc::new(profiles)))
    }

    fn make_server() -> LocusServer {
        LocusServer::new(ServerConfig::default(), authenticator(), None)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    async fn status_of(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn credential_from_query_wins() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::SEC_WEBSOCKET_PROTOCOL, "proto-token".parse().unwrap());
        let params = WsParams {
            token: Some("query-token".into()),
        };
        assert_eq!(
            extract_credential(&params, &headers),
            (Some("query-token".into()), false)
        );
    }

    #[test]
    fn credential_from_subprotocol() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(header::SEC_WEBSOCKET_PROTOCOL, " abc.def.ghi , other".parse().unwrap());
        assert_eq!(
            extract_credential(&WsParams::default(), &headers),
            (Some("abc.def.ghi".into()), true)
        );
        assert_eq!(extract_credential(&WsParams::default(), &HeaderMap::new()), (None, false));
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, body) = get_json(make_server().router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["websocket"]["status"], "active");
    }

    #[tokio::test]
    async fn ws_status_reports_counters() {
        let (status, body) = get_json(make_server().router(), "/ws-status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["activeSharingUsers"], 0);
        assert_eq!(body["pendingUpdates"], 0);
        assert_eq!(body["topics"], 0);
    }

    #[tokio::test]
    async fn ws_without_token_is_unauthorized() {
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        assert_eq!(status_of(make_server().router(), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_with_bad_token_is_unauthorized() {
        let req = Request::builder()
            .uri("/ws?token=not-a-jwt")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(make_server().router(), req).await, StatusCode::UNAUTHORIZED);

        let forged = TokenVerifier::new("other-secret")
            .issue(&UserId::from("u1"), 1, Duration::from_secs(60))
            .unwrap();
        let req = Request::builder()
            .uri("/ws")
            .header(header::SEC_WEBSOCKET_PROTOCOL, forged)
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(make_server().router(), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_without_upgrade_is_not_unauthorized() {
        let token = TokenVerifier::new(SECRET)
            .issue(&UserId::from("u1"), 1, Duration::from_secs(60))
            .unwrap();
        let req = Request::builder()
            .uri(format!("/ws?token={token}"))
            .body(Body::empty())
            .unwrap();
        let status = status_of(make_server().router(), req).await;
        assert_ne!(status, StatusCode::UNAUTHORIZED);
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        assert_eq!(status_of(make_server().router(), req).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = LocusServer::new(ServerConfig::default(), authenticator(), Some(handle));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        assert_eq!(status_of(server.router(), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        assert_eq!(status_of(make_server().router(), req).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        server.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn accessors() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.hub().connection_count(), 0);
        assert!(!server.shutdown().is_shutting_down());
    }
}
