//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::presence::PresenceHub;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The monitor was cancelled externally.
    Cancelled,
}

/// Probe every connection of `hub` once per `interval`.
///
/// Each tick terminates connections that have not answered the previous
/// probe and sends a fresh Ping to the rest, so a dead client is removed
/// between one and two intervals after it stops responding.
pub async fn run_heartbeat_monitor(
    hub: Arc<PresenceHub>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "heartbeat monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let terminated = hub.heartbeat_tick();
                if terminated > 0 {
                    info!(terminated, remaining = hub.connection_count(), "heartbeat removed unresponsive clients");
                } else {
                    debug!(connections = hub.connection_count(), "heartbeat tick");
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::websocket::connection::OutboundFrame;
    use crate::websocket::connection::test_support::identity;
    use locus_auth::Role;
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn hub() -> Arc<PresenceHub> {
        PresenceHub::new(PresenceConfig {
            heartbeat_interval_ms: 100,
            ..PresenceConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_cancelled() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat_monitor(hub(), INTERVAL, cancel.clone()));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_removed_after_second_tick() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = hub.connect(&identity("quiet", Role::Member), tx, usize::MAX).unwrap().connection;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat_monitor(hub.clone(), INTERVAL, cancel.clone()));

        time::sleep(INTERVAL + Duration::from_millis(10)).await;
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Ping);
        assert!(!conn.is_terminated());

        time::sleep(INTERVAL).await;
        assert!(conn.is_terminated());
        assert_eq!(hub.connection_count(), 0);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_client_stays() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = hub.connect(&identity("chatty", Role::Member), tx, usize::MAX).unwrap().connection;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat_monitor(hub.clone(), INTERVAL, cancel.clone()));

        time::sleep(INTERVAL / 2).await;
        for _ in 0..5 {
            time::sleep(INTERVAL).await;
            while let Ok(frame) = rx.try_recv() {
                if frame == OutboundFrame::Ping {
                    conn.mark_alive();
                }
            }
        }
        assert!(!conn.is_terminated());
        assert_eq!(hub.connection_count(), 1);

        cancel.cancel();
        let _ = handle.await.unwrap();
    }
}
