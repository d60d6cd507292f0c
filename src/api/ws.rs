//! WebSocket channel.
//!
//! Single endpoint upgraded from HTTP. The server pushes `{event, payload}`
//! frames for every bus topic; clients may narrow the stream with
//! `{action: "subscribe", topics: [...]}`. Heartbeat pings go out every
//! 20 s; two missed pongs drop the subscription. Delivery is best-effort:
//! a lagging client loses the oldest frames (counted and logged) and is
//! expected to reconcile with a state fetch.

use crate::api::AppState;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Deserialize)]
struct ClientCommand {
    action: String,
    #[serde(default)]
    topics: Vec<String>,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut bus_rx = state.bus.subscribe();

    // None subscribes to every topic (the default).
    let mut topics: Option<HashSet<String>> = None;
    let mut dropped: u64 = 0;
    let mut last_pong = Instant::now();

    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    // interval ticks immediately; skip the first so the handshake settles.
    heartbeat.tick().await;

    info!("websocket subscriber connected");
    loop {
        tokio::select! {
            event = bus_rx.recv() => match event {
                Ok(event) => {
                    let wanted = topics
                        .as_ref()
                        .map(|t| t.contains(&event.event))
                        .unwrap_or(true);
                    if !wanted {
                        continue;
                    }
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(%err, "failed to serialize event frame");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    dropped += n;
                    warn!(lagged = n, total_dropped = dropped, "subscriber lagging; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(command) if command.action == "subscribe" => {
                            debug!(topics = ?command.topics, "subscription filter updated");
                            topics = if command.topics.is_empty() {
                                None
                            } else {
                                Some(command.topics.into_iter().collect())
                            };
                        }
                        Ok(command) => {
                            warn!(action = %command.action, "ignoring unknown ws action");
                        }
                        Err(err) => {
                            warn!(%err, "ignoring malformed ws command");
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    last_pong = Instant::now();
                }
                Some(Ok(Message::Ping(payload))) => {
                    if ws_tx.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    warn!(%err, "websocket receive error");
                    break;
                }
                _ => {}
            },
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > HEARTBEAT_INTERVAL * 2 {
                    info!("dropping subscriber after two missed heartbeats");
                    break;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    info!(dropped, "websocket subscriber disconnected");
}
