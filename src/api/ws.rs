// =============================================================================
// WebSocket Handler — live P&L and snapshot push
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A `live_pnl` message for every runner broadcast, forwarded as it
//      happens.
//   3. A fresh snapshot whenever state_version changed, checked every
//      500 ms.
//
// Ping frames are answered with Pong; text frames count as client
// heartbeats.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade; token checked before upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !validate_token(&query.token.unwrap_or_default()) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut live_rx = state.live_updates_tx.subscribe();

    // Initial snapshot.
    if send_json(
        &mut sender,
        &state,
        &serde_json::json!({ "type": "snapshot", "payload": state.build_snapshot() }),
    )
    .await
    .is_err()
    {
        return;
    }
    let mut last_sent_version = state.current_state_version();

    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            // ── Forward live P&L payloads as they arrive ────────────────
            update = live_rx.recv() => {
                match update {
                    Ok(update) => {
                        let msg = serde_json::json!({ "type": "live_pnl", "payload": update });
                        if send_json(&mut sender, &state, &msg).await.is_err() {
                            break;
                        }
                    }
                    // Lagged subscribers skip ahead; the periodic snapshot
                    // resynchronises them.
                    Err(_) => {}
                }
            }

            // ── Snapshot push on version change ─────────────────────────
            _ = push_interval.tick() => {
                let version = state.current_state_version();
                if version != last_sent_version {
                    let msg = serde_json::json!({
                        "type": "snapshot",
                        "payload": state.build_snapshot(),
                    });
                    if send_json(&mut sender, &state, &msg).await.is_err() {
                        break;
                    }
                    last_sent_version = version;
                }
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket heartbeat received");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_json<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    value: &serde_json::Value,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;

    state
        .ws_sequence_number
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    match serde_json::to_string(value) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation failure is not a transport failure.
            warn!(error = %e, "failed to serialise WebSocket message");
            Ok(())
        }
    }
}
