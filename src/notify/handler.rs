//! WebSocket endpoint for notification delivery.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};

use crate::api::AppState;

use super::hub::NotificationHub;
use super::types::{NotifyCommand, NotifyEvent};

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket upgrade handler.
///
/// GET /api/notifications/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.notifications.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, hub))
}

async fn handle_connection(socket: WebSocket, hub: Arc<NotificationHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut event_rx) = hub.register();

    // Writer: drain the per-client buffer and keep the link warm.
    let hub_writer = hub.clone();
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // first tick fires immediately, skip it

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!("failed to serialize notification: {err}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                _ = ping.tick() => {
                    let ping_event = NotifyEvent::Ping {
                        timestamp: Utc::now().timestamp_millis(),
                    };
                    let json = match serde_json::to_string(&ping_event) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        // A dead writer means this client can no longer receive anything.
        hub_writer.unregister(client_id);
    });

    // Reader: only `identify` matters, everything else is discarded.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<NotifyCommand>(text.as_str()) {
                    Ok(NotifyCommand::Identify { instance_id }) => {
                        if let Some(instance_id) = instance_id {
                            hub.identify(client_id, instance_id);
                        }
                    }
                    Err(_) => debug!("ignoring unrecognized notification client frame"),
                }
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    hub.unregister(client_id);
}
