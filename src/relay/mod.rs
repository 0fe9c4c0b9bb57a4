//! Relay orchestration: one task per client chat request.
//!
//! The relay resolves the target bridge, registers the request with the
//! session, writes the `chat_request` frame, and pumps whatever the
//! bridge sends back into the streams the SSE adapter drains. Forwards
//! toward the client are non-blocking; a stuck consumer costs dropped
//! frames, never a stalled pump, and the inactivity deadline stays
//! authoritative.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bridge::protocol::{ChatMessage, FileResponseFrame};
use crate::bridge::requests::RequestStreams;
use crate::bridge::BridgeRegistry;

/// Abort a relay after this long without any inbound frame.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(120);

/// How long file events are still forwarded after the delta stream ends.
/// Artifacts may be materialized by tools after the reply text finishes.
pub const FILE_DRAIN_WINDOW: Duration = Duration::from_secs(30);

const OUT_DELTA_BUFFER: usize = 16;
const OUT_FILE_BUFFER: usize = 8;

/// Terminal relay outcomes surfaced to the client as SSE error events.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("instance not found")]
    InstanceNotFound,

    #[error("failed to send chat request: {0}")]
    Send(String),

    #[error("chat error: {0}")]
    Chat(String),

    #[error("bridge disconnected")]
    BridgeDisconnected,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("internal relay error: {0}")]
    Internal(String),
}

/// Streams the SSE adapter drains. The delta stream closing marks the
/// end of the reply text; the file stream may deliver afterwards.
pub struct RelayOutput {
    pub deltas: mpsc::Receiver<String>,
    pub files: mpsc::Receiver<FileResponseFrame>,
    pub errors: mpsc::Receiver<RelayError>,
}

enum PumpEnd {
    /// Bridge signalled `done=true`.
    Done,
    /// Client-side receivers dropped; nobody is listening anymore.
    ClientGone,
}

/// Fresh id for one client chat request.
pub fn generate_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// Start a relay for one client request and hand back its output streams.
pub fn spawn_relay(
    registry: Arc<BridgeRegistry>,
    instance_id: String,
    request_id: String,
    messages: Vec<ChatMessage>,
    user: String,
) -> RelayOutput {
    let (delta_tx, delta_rx) = mpsc::channel(OUT_DELTA_BUFFER);
    let (file_tx, file_rx) = mpsc::channel(OUT_FILE_BUFFER);
    let (error_tx, error_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        run_relay(registry, instance_id, request_id, messages, user, delta_tx, file_tx, error_tx)
            .await;
    });

    RelayOutput {
        deltas: delta_rx,
        files: file_rx,
        errors: error_rx,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_relay(
    registry: Arc<BridgeRegistry>,
    instance_id: String,
    request_id: String,
    messages: Vec<ChatMessage>,
    user: String,
    delta_tx: mpsc::Sender<String>,
    file_tx: mpsc::Sender<FileResponseFrame>,
    error_tx: mpsc::Sender<RelayError>,
) {
    let Some(session) = registry.get(&instance_id) else {
        let _ = error_tx.try_send(RelayError::InstanceNotFound);
        return;
    };

    let mut streams = match session.requests().register(&request_id) {
        Ok(streams) => streams,
        Err(err) => {
            let _ = error_tx.try_send(RelayError::Internal(err.to_string()));
            return;
        }
    };

    if let Err(err) = session
        .send_chat_request(&request_id, messages, &user)
        .await
    {
        let _ = error_tx.try_send(RelayError::Send(err.to_string()));
        session.requests().unregister(&request_id);
        return;
    }
    info!(
        "chat request sent to bridge {} (request {})",
        session.id(),
        request_id
    );

    match pump(&mut streams, &delta_tx, &file_tx, &request_id).await {
        Ok(PumpEnd::Done) => {
            debug!("chat request completed: {request_id}");
            // Closing the delta stream moves the client into its drain loop.
            drop(delta_tx);
            drain_files(&mut streams, &file_tx, &request_id).await;
        }
        Ok(PumpEnd::ClientGone) => {
            debug!("client left before completion of {request_id}");
        }
        Err(err) => {
            let _ = error_tx.try_send(err);
        }
    }

    session.requests().unregister(&request_id);
}

/// Forward bridge frames until `done`, an error, a disconnect, or the
/// inactivity deadline. The deadline resets on every inbound frame.
async fn pump(
    streams: &mut RequestStreams,
    delta_tx: &mpsc::Sender<String>,
    file_tx: &mpsc::Sender<FileResponseFrame>,
    request_id: &str,
) -> Result<PumpEnd, RelayError> {
    let deadline = tokio::time::sleep(RELAY_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        // Biased polling drains queued deltas before a racing error or
        // disconnect can terminate the request, preserving delivery order.
        tokio::select! {
            biased;

            response = streams.delta.recv() => {
                let Some(frame) = response else {
                    return Err(RelayError::BridgeDisconnected);
                };
                deadline.as_mut().reset(Instant::now() + RELAY_TIMEOUT);

                if !frame.delta.is_empty() {
                    match delta_tx.try_send(frame.delta) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("client delta buffer full, token dropped ({request_id})");
                        }
                        Err(TrySendError::Closed(_)) => return Ok(PumpEnd::ClientGone),
                    }
                }
                if frame.done {
                    return Ok(PumpEnd::Done);
                }
            }

            file = streams.file.recv() => {
                let Some(frame) = file else {
                    return Err(RelayError::BridgeDisconnected);
                };
                deadline.as_mut().reset(Instant::now() + RELAY_TIMEOUT);

                match file_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("client file buffer full, artifact event dropped ({request_id})");
                    }
                    Err(TrySendError::Closed(_)) => return Ok(PumpEnd::ClientGone),
                }
            }

            error = streams.error.recv() => {
                let Some(frame) = error else {
                    return Err(RelayError::BridgeDisconnected);
                };
                return Err(RelayError::Chat(frame.error));
            }

            _ = &mut deadline => {
                return Err(RelayError::Timeout);
            }
        }
    }
}

/// Keep forwarding late file events for a bounded window after `done`.
async fn drain_files(
    streams: &mut RequestStreams,
    file_tx: &mpsc::Sender<FileResponseFrame>,
    request_id: &str,
) {
    let deadline = Instant::now() + FILE_DRAIN_WINDOW;

    loop {
        match tokio::time::timeout_at(deadline, streams.file.recv()).await {
            Ok(Some(frame)) => {
                if file_tx.try_send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                debug!("file drain window elapsed for {request_id}");
                break;
            }
        }
    }
}
