//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup; a second install fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Disconnects total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Session duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Connections replaced by a newer one for the same user (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Rejected upgrade attempts (counter, labels: reason).
pub const WS_AUTH_REJECTIONS_TOTAL: &str = "ws_auth_rejections_total";
/// Inbound frames dropped as malformed (counter).
pub const WS_MALFORMED_MESSAGES_TOTAL: &str = "ws_malformed_messages_total";
/// Frames dropped on a full outbound queue (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Presence frames handed to recipients (counter, labels: kind).
pub const PRESENCE_BROADCASTS_TOTAL: &str = "presence_broadcasts_total";
/// Throttled rebroadcasts fired (counter).
pub const PRESENCE_SCHEDULED_FLUSHES_TOTAL: &str = "presence_scheduled_flushes_total";
/// Tombstoned records purged (counter).
pub const PRESENCE_PURGES_TOTAL: &str = "presence_purges_total";
/// Connections terminated by the heartbeat monitor (counter).
pub const HEARTBEAT_TERMINATIONS_TOTAL: &str = "heartbeat_terminations_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            WS_EVICTIONS_TOTAL,
            WS_AUTH_REJECTIONS_TOTAL,
            WS_MALFORMED_MESSAGES_TOTAL,
            WS_BROADCAST_DROPS_TOTAL,
            PRESENCE_BROADCASTS_TOTAL,
            PRESENCE_SCHEDULED_FLUSHES_TOTAL,
            PRESENCE_PURGES_TOTAL,
            HEARTBEAT_TERMINATIONS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
