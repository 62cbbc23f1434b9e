//! WebSocket session lifecycle: one authenticated client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use locus_auth::Identity;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, OutboundFrame};
use crate::metrics::{WS_CONNECTION_DURATION_SECONDS, WS_MALFORMED_MESSAGES_TOTAL};
use crate::presence::{Connected, DisconnectReason, PresenceHub};

/// How long the writer gets to flush a Close frame after the reader ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a WebSocket session for an authenticated client.
///
/// 1. Registers the connection with the hub
/// 2. Writes the catch-up snapshot, then forwards queued frames and heartbeat
///    Pings to the socket
/// 3. Hands inbound text frames to the hub
/// 4. Runs disconnect cleanup when the socket closes or the hub terminates it
#[instrument(skip_all, fields(user_id = %identity.user_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    identity: Identity,
    hub: Arc<PresenceHub>,
    outbound_buffer: usize,
    max_connections: usize,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<OutboundFrame>(outbound_buffer.max(1));
    let Connected { connection, catch_up } = match hub.connect(&identity, send_tx, max_connections) {
        Ok(connected) => connected,
        Err(error) => {
            warn!(%error, "refusing upgraded socket");
            let close = CloseFrame {
                code: close_code::AGAIN,
                reason: "Too many connections".into(),
            };
            let _ = ws_tx.send(Message::Close(Some(close))).await;
            return;
        }
    };
    let session_start = Instant::now();

    let outbound_conn = Arc::clone(&connection);
    let outbound = tokio::spawn(async move {
        // written straight to the socket; frames queued meanwhile follow it
        for frame in catch_up {
            if ws_tx.send(Message::Text(String::clone(&frame).into())).await.is_err() {
                outbound_conn.terminate();
                return;
            }
        }
        loop {
            tokio::select! {
                biased;
                () = outbound_conn.closed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                frame = send_rx.recv() => {
                    let message = match frame {
                        Some(OutboundFrame::Text(text)) => Message::Text(String::clone(&text).into()),
                        Some(OutboundFrame::Ping) => Message::Ping(vec![].into()),
                        None => break,
                    };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
        outbound_conn.terminate();
    });

    let reason = loop {
        let next = tokio::select! {
            () = connection.closed() => break DisconnectReason::ConnectionClosed,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => dispatch(&hub, &connection, text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch(&hub, &connection, text),
                Err(_) => {
                    counter!(WS_MALFORMED_MESSAGES_TOTAL).increment(1);
                    debug!(len = data.len(), "dropping non-UTF8 binary frame");
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.mark_alive(),
            Some(Ok(Message::Close(_))) => {
                debug!("client sent close frame");
                break DisconnectReason::ConnectionClosed;
            }
            None => break DisconnectReason::ConnectionClosed,
            Some(Err(error)) => {
                debug!(%error, "websocket receive error");
                break DisconnectReason::TransportError;
            }
        }
    };

    // no-op if the hub already cleaned up or a newer connection replaced this one
    let _ = hub.disconnect(&connection.user_id, &connection.id, reason);
    connection.terminate();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, outbound).await.is_err() {
        debug!("outbound writer did not finish in time");
    }

    histogram!(WS_CONNECTION_DURATION_SECONDS).record(session_start.elapsed().as_secs_f64());
    info!(conn_id = %connection.id, "session ended");
}

fn dispatch(hub: &PresenceHub, connection: &Arc<ClientConnection>, text: &str) {
    if let Err(error) = hub.handle_text(connection, text) {
        counter!(WS_MALFORMED_MESSAGES_TOTAL).increment(1);
        debug!(conn_id = %connection.id, %error, "dropping inbound frame");
    }
}
