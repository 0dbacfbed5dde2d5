// =============================================================================
// WebSocket Endpoints — broadcast-manager fan-out with ping heartbeats
// =============================================================================
//
// `/dht/latest` and `/pico/latest` send an initial snapshot from the
// database, then every published event; `/alerts` is transient and sends
// events only. All three send an application-level `{"type": "ping"}` at
// a fixed interval so idle proxies do not reap the connection. Events
// arrive via the broadcast manager, which is fed by the server's single
// bus subscription.
// =============================================================================

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::db::queries::{dht_latest, pico_latest};
use crate::server::broadcast::Endpoint;
use crate::server::state::SharedState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn dht_latest_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Endpoint::DhtLatest))
}

pub async fn pico_latest_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Endpoint::PicoLatest))
}

pub async fn alerts_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Endpoint::Alerts))
}

/// Initial payload per endpoint. Alerts are transient: no snapshot.
async fn initial_snapshot(state: &SharedState, endpoint: Endpoint) -> Option<String> {
    let mut conn = match endpoint {
        Endpoint::Alerts => return None,
        _ => match state.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, endpoint = endpoint.path(), "ws: no initial snapshot");
                return None;
            }
        },
    };
    match endpoint {
        Endpoint::DhtLatest => dht_latest(&mut conn)
            .await
            .ok()
            .flatten()
            .and_then(|row| serde_json::to_string(&row).ok()),
        Endpoint::PicoLatest => pico_latest(&mut conn)
            .await
            .ok()
            .filter(|rows| !rows.is_empty())
            .and_then(|rows| serde_json::to_string(&rows).ok()),
        Endpoint::Alerts => None,
    }
}

async fn handle_socket(socket: WebSocket, state: SharedState, endpoint: Endpoint) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(snapshot) = initial_snapshot(&state, endpoint).await {
        if sender.send(Message::Text(snapshot.into())).await.is_err() {
            return;
        }
    }

    let (client_id, mut events) = state.broadcast.connect(endpoint);
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping goes out a full interval after connect.
    ping.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(payload) = event else { break };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    debug!(endpoint = endpoint.path(), "ws send failed, disconnecting");
                    break;
                }
            }

            _ = ping.tick() => {
                let ping_frame = serde_json::json!({"type": "ping"}).to_string();
                if sender.send(Message::Text(ping_frame.into())).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/binary/pong from clients: ignored
                    Some(Err(e)) => {
                        debug!(endpoint = endpoint.path(), error = %e, "ws receive error");
                        break;
                    }
                }
            }
        }
    }

    state.broadcast.disconnect(endpoint, client_id);
}
