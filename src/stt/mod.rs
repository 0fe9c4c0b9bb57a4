//! Speech-to-text WebSocket proxy.
//!
//! Pipes a client's PCM audio frames to the upstream recognizer and
//! rewraps the recognizer's partial/final JSON for the app. The proxy is
//! stateless across sessions; each connection dials its own upstream
//! socket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use crate::api::AppState;

/// How long to wait for the recognizer to accept the connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Tells the recognizer to finalize the utterance after the client left.
const EOF_SENTINEL: &str = r#"{"eof":1}"#;

/// Configuration for the recognizer proxy.
pub struct SttProxy {
    upstream_url: String,
    filler_phrases: Vec<String>,
}

impl SttProxy {
    pub fn new(upstream_url: String, filler_phrases: Vec<String>) -> Self {
        Self {
            upstream_url,
            filler_phrases,
        }
    }

    /// Rewrap one recognizer frame for the app, or drop it.
    ///
    /// `{"partial": ...}` becomes an interim result, `{"text": ...}` a
    /// final one; empty strings and configured filler phrases produce
    /// nothing.
    fn translate(&self, raw: &str) -> Option<String> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!("recognizer sent unparsable frame: {err}");
                return None;
            }
        };

        if let Some(partial) = value.get("partial").and_then(|v| v.as_str()) {
            if !partial.is_empty() {
                return Some(json!({"type": "partial", "text": partial}).to_string());
            }
        }

        if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
            if !text.is_empty() && !self.filler_phrases.iter().any(|phrase| phrase == text) {
                info!("final transcript: {text}");
                return Some(json!({"type": "final", "text": text}).to_string());
            }
        }

        None
    }
}

/// WebSocket upgrade handler.
///
/// GET /api/stt/stream
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let proxy = state.stt.clone();
    ws.on_upgrade(move |socket| handle_stream(socket, proxy))
}

async fn handle_stream(mut client: WebSocket, proxy: Arc<SttProxy>) {
    let upstream =
        tokio::time::timeout(DIAL_TIMEOUT, connect_async(proxy.upstream_url.as_str())).await;
    let (upstream, _) = match upstream {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            warn!("recognizer dial failed ({}): {err}", proxy.upstream_url);
            let _ = client
                .send(ClientMessage::Text(
                    json!({"type": "error", "text": "speech recognizer unavailable"})
                        .to_string()
                        .into(),
                ))
                .await;
            return;
        }
        Err(_) => {
            warn!("recognizer dial timed out ({})", proxy.upstream_url);
            let _ = client
                .send(ClientMessage::Text(
                    json!({"type": "error", "text": "speech recognizer unavailable"})
                        .to_string()
                        .into(),
                ))
                .await;
            return;
        }
    };

    debug!("recognizer session opened");
    let (mut upstream_write, mut upstream_read) = upstream.split();
    let (mut client_write, mut client_read) = client.split();

    // Client -> recognizer: forward frames verbatim; on client loss send
    // one EOF sentinel so the recognizer flushes a final result.
    let client_to_upstream = async {
        loop {
            match client_read.next().await {
                Some(Ok(ClientMessage::Text(text))) => {
                    if upstream_write
                        .send(UpstreamMessage::Text(text.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(ClientMessage::Binary(data))) => {
                    if upstream_write
                        .send(UpstreamMessage::Binary(data))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(ClientMessage::Close(_))) | Some(Err(_)) | None => {
                    let _ = upstream_write
                        .send(UpstreamMessage::Text(EOF_SENTINEL.into()))
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    };

    // Recognizer -> client: rewrap partial/final frames.
    let upstream_to_client = async {
        while let Some(msg) = upstream_read.next().await {
            match msg {
                Ok(UpstreamMessage::Text(text)) => {
                    if let Some(out) = proxy.translate(text.as_str()) {
                        if client_write
                            .send(ClientMessage::Text(out.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Ok(UpstreamMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    // Either side ending tears the whole session down.
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    debug!("recognizer session closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> SttProxy {
        SttProxy::new(
            "ws://127.0.0.1:2700".to_string(),
            vec!["인식 중...".to_string(), "인식 중".to_string()],
        )
    }

    #[test]
    fn test_partial_is_rewrapped() {
        let out = proxy().translate(r#"{"partial":"hel"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["type"], "partial");
        assert_eq!(value["text"], "hel");
    }

    #[test]
    fn test_final_is_rewrapped() {
        let out = proxy().translate(r#"{"text":"hello world"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["type"], "final");
        assert_eq!(value["text"], "hello world");
    }

    #[test]
    fn test_filler_phrases_are_suppressed() {
        assert!(proxy().translate(r#"{"text":"인식 중"}"#).is_none());
        assert!(proxy().translate(r#"{"text":"인식 중..."}"#).is_none());
    }

    #[test]
    fn test_empty_results_are_dropped() {
        assert!(proxy().translate(r#"{"partial":""}"#).is_none());
        assert!(proxy().translate(r#"{"text":""}"#).is_none());
    }

    #[test]
    fn test_garbage_is_dropped() {
        assert!(proxy().translate("not json").is_none());
        assert!(proxy().translate(r#"{"confidence":0.3}"#).is_none());
    }
}
