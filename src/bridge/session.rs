//! One live bridge connection.
//!
//! A session is created once the registration handshake succeeds and
//! lives until its read loop exits. The read loop is the only reader of
//! the socket; all writes are serialized through a per-session lock so
//! chat requests never interleave bytes with anything else.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::codec::{self, CodecError};
use super::protocol::{ChatMessage, ChatRequestFrame, Frame};
use super::registry::BridgeRegistry;
use super::requests::RequestRegistry;

/// A bridge that has not registered within this window is cut off.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Online,
    Offline,
}

/// Shallow, client-facing view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub connected_at: DateTime<Utc>,
}

/// Why a connection never became a session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no register frame within {HANDSHAKE_TIMEOUT:?}")]
    Timeout,

    #[error("expected register frame, got {0}")]
    UnexpectedFrame(&'static str),

    #[error("bridge token mismatch")]
    InvalidToken,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A registered bridge connection.
pub struct BridgeSession {
    id: String,
    name: String,
    connected_at: DateTime<Utc>,
    status: Mutex<InstanceStatus>,
    last_ping: Mutex<Instant>,
    writer: AsyncMutex<OwnedWriteHalf>,
    requests: RequestRegistry,
    close: Notify,
}

impl BridgeSession {
    /// Run the registration handshake on a fresh connection.
    ///
    /// The first frame must be `register` with the expected token; anything
    /// else (including silence for [`HANDSHAKE_TIMEOUT`]) fails and the
    /// caller drops the connection without further service.
    pub async fn handshake(
        stream: TcpStream,
        expected_token: &str,
    ) -> Result<(Self, OwnedReadHalf), HandshakeError> {
        let (mut read_half, write_half) = stream.into_split();

        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, codec::read_frame(&mut read_half))
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        let register = match frame {
            Frame::Register(register) => register,
            other => return Err(HandshakeError::UnexpectedFrame(other.tag())),
        };

        if register.token != expected_token {
            return Err(HandshakeError::InvalidToken);
        }

        let id = format!("bridge-{}", short_uuid());
        info!("bridge registered: {} ({})", register.name, id);

        let session = Self {
            id,
            name: register.name,
            connected_at: Utc::now(),
            status: Mutex::new(InstanceStatus::Online),
            last_ping: Mutex::new(Instant::now()),
            writer: AsyncMutex::new(write_half),
            requests: RequestRegistry::new(),
            close: Notify::new(),
        };

        Ok((session, read_half))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The in-flight request channels owned by this session.
    pub fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    /// Client-facing view, without any operational state.
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: *self.status.lock().unwrap(),
            connected_at: self.connected_at,
        }
    }

    /// Record a heartbeat.
    pub fn touch(&self) {
        *self.last_ping.lock().unwrap() = Instant::now();
    }

    /// Whether the last heartbeat is older than `ttl`.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_ping.lock().unwrap().elapsed() > ttl
    }

    pub fn mark_offline(&self) {
        *self.status.lock().unwrap() = InstanceStatus::Offline;
    }

    /// Ask the read loop to exit; teardown happens on its cleanup path.
    pub fn close(&self) {
        self.close.notify_one();
    }

    async fn closed(&self) {
        self.close.notified().await;
    }

    /// Serialize and send a `chat_request` frame under the writer lock.
    pub async fn send_chat_request(
        &self,
        request_id: &str,
        messages: Vec<ChatMessage>,
        user: &str,
    ) -> Result<(), CodecError> {
        let frame = Frame::ChatRequest(ChatRequestFrame {
            request_id: request_id.to_string(),
            messages,
            user: user.to_string(),
        });

        let mut writer = self.writer.lock().await;
        codec::write_frame(&mut *writer, &frame).await
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Heartbeat => self.touch(),
            Frame::ChatResponse(frame) => self.requests.dispatch_response(frame),
            Frame::ChatError(frame) => self.requests.dispatch_error(frame),
            Frame::FileResponse(frame) => self.requests.dispatch_file(frame),
            other => warn!(
                "unexpected {} frame from bridge {}, ignoring",
                other.tag(),
                self.id
            ),
        }
    }
}

/// Pump frames from the bridge until the socket dies or the session is
/// closed, then tear everything down.
///
/// Teardown unregisters the session and closes every request channel it
/// owned, which is what tells in-flight relays the bridge is gone.
pub async fn run_read_loop(
    session: Arc<BridgeSession>,
    mut reader: OwnedReadHalf,
    registry: Arc<BridgeRegistry>,
) {
    loop {
        tokio::select! {
            _ = session.closed() => {
                debug!("bridge {} closed by supervisor", session.id());
                break;
            }
            body = codec::read_raw(&mut reader) => match body {
                Ok(body) => {
                    // Invalid JSON is a corrupt stream and kills the
                    // session; a well-formed frame of an unknown type is
                    // merely skipped.
                    let value: serde_json::Value = match serde_json::from_slice(&body) {
                        Ok(value) => value,
                        Err(err) => {
                            info!("bridge {} sent invalid JSON: {err}", session.id());
                            break;
                        }
                    };
                    match serde_json::from_value::<Frame>(value) {
                        Ok(frame) => session.dispatch(frame),
                        Err(err) => {
                            warn!("unrecognized frame from bridge {}: {err}", session.id());
                        }
                    }
                }
                Err(err) => {
                    info!("bridge {} read loop ended: {}", session.id(), err);
                    break;
                }
            }
        }
    }

    registry.remove(session.id());
    session.requests().close_all();
    info!("bridge disconnected: {} ({})", session.name(), session.id());
}

fn short_uuid() -> String {
    let id = Uuid::new_v4().to_string();
    id.split('-').next().unwrap_or(&id).to_string()
}
