//! Chat SSE adapter.
//!
//! Turns one `POST /api/chat` into a relay task and streams its output
//! as Server-Sent Events. Every event is one `data: ...\n\n` chunk so
//! intermediate proxies cannot coalesce them. After the reply text ends,
//! late file artifacts are serviced for a bounded drain window before
//! the terminating `[DONE]`.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::bridge::protocol::ChatMessage;
use crate::relay::{self, RelayOutput, FILE_DRAIN_WINDOW};

use super::error::ApiError;
use super::state::AppState;

const EVENT_BUFFER_SIZE: usize = 32;

/// Client-facing chat request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Accepted for client-side history grouping; the relay ignores it.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Reject malformed chat requests with the exact messages clients key on.
pub fn validate_chat_request(req: &ChatRequest) -> Result<(), String> {
    if req.instance_id.is_empty() {
        return Err("instanceId is required".to_string());
    }
    if req.messages.is_empty() {
        return Err("messages are required".to_string());
    }
    for (i, msg) in req.messages.iter().enumerate() {
        if msg.role.is_empty() {
            return Err(format!("message[{i}]: role is required"));
        }
        if msg.content.is_empty() {
            return Err(format!("message[{i}]: content is required"));
        }
        if !matches!(msg.role.as_str(), "user" | "assistant" | "system") {
            return Err(format!("message[{i}]: invalid role '{}'", msg.role));
        }
    }
    Ok(())
}

/// POST /api/chat
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    validate_chat_request(&req).map_err(ApiError::bad_request)?;

    if req.instance_id == "local" && state.settings.local_gateway_enabled() {
        return Ok(local_chat(state, req));
    }

    if state.bridges.get(&req.instance_id).is_none() {
        return Err(ApiError::not_found("Instance not found"));
    }

    let request_id = relay::generate_request_id();
    info!(
        "starting chat relay: instance={}, request={}",
        req.instance_id, request_id
    );

    let output = relay::spawn_relay(
        state.bridges.clone(),
        req.instance_id,
        request_id,
        req.messages,
        String::new(),
    );

    let (tx, rx) = mpsc::channel::<Bytes>(EVENT_BUFFER_SIZE);
    tokio::spawn(pump_relay_events(output, tx));

    Ok(sse_response(rx))
}

/// Wrap an event stream in the SSE response envelope.
fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn send_event(tx: &mpsc::Sender<Bytes>, payload: serde_json::Value) -> Result<(), ()> {
    let chunk = format!("data: {payload}\n\n");
    tx.send(Bytes::from(chunk)).await.map_err(|_| ())
}

async fn send_done(tx: &mpsc::Sender<Bytes>) {
    let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
}

/// Marshal relay output into SSE events.
///
/// The delta stream closing is the normal end of the reply; the drain
/// phase then services late file events (and any terminal error that
/// raced the close) before `[DONE]`. Dropping the response body cancels
/// this task's sends, which cascades into relay cleanup.
async fn pump_relay_events(mut output: RelayOutput, tx: mpsc::Sender<Bytes>) {
    let mut errors_open = true;
    let mut files_open = true;

    loop {
        // Biased polling flushes queued deltas before a terminal error
        // can close the stream underneath them.
        tokio::select! {
            biased;

            delta = output.deltas.recv() => match delta {
                Some(delta) => {
                    if send_event(&tx, json!({ "delta": delta })).await.is_err() {
                        return;
                    }
                }
                None => break,
            },

            file = output.files.recv(), if files_open => match file {
                Some(file) => {
                    if send_file_event(&tx, &file.url, &file.filename, file.size).await.is_err() {
                        return;
                    }
                }
                None => files_open = false,
            },

            error = output.errors.recv(), if errors_open => match error {
                Some(err) => {
                    let _ = send_event(&tx, json!({ "error": err.to_string() })).await;
                    send_done(&tx).await;
                    return;
                }
                None => errors_open = false,
            },
        }
    }

    // Reply text is finished; keep the connection for late artifacts.
    let drain = tokio::time::sleep(FILE_DRAIN_WINDOW);
    tokio::pin!(drain);

    while errors_open || files_open {
        tokio::select! {
            biased;

            file = output.files.recv(), if files_open => match file {
                Some(file) => {
                    if send_file_event(&tx, &file.url, &file.filename, file.size).await.is_err() {
                        return;
                    }
                }
                None => files_open = false,
            },

            error = output.errors.recv(), if errors_open => match error {
                Some(err) => {
                    let _ = send_event(&tx, json!({ "error": err.to_string() })).await;
                    send_done(&tx).await;
                    return;
                }
                None => errors_open = false,
            },

            _ = &mut drain => break,
        }
    }

    send_done(&tx).await;
}

async fn send_file_event(
    tx: &mpsc::Sender<Bytes>,
    url: &str,
    filename: &str,
    size: u64,
) -> Result<(), ()> {
    send_event(
        tx,
        json!({ "file": { "url": url, "filename": filename, "size": size } }),
    )
    .await
}

// ============================================================================
// Local gateway bypass
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: CompletionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionDelta {
    #[serde(default)]
    content: String,
}

/// Serve `instanceId == "local"` straight from the co-located
/// OpenAI-compatible gateway, bypassing the bridge fabric.
fn local_chat(state: AppState, req: ChatRequest) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(EVENT_BUFFER_SIZE);
    tokio::spawn(run_local_chat(state, req, tx));
    sse_response(rx)
}

async fn run_local_chat(state: AppState, req: ChatRequest, tx: mpsc::Sender<Bytes>) {
    let base_url = state.settings.local.url.clone().unwrap_or_default();
    let url = format!("{base_url}/v1/chat/completions");

    let messages: Vec<_> = req
        .messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    let body = json!({
        "model": "openclaw",
        "stream": true,
        "user": "voxrelay-app",
        "messages": messages,
    });

    let mut request = state
        .http_client
        .post(&url)
        .header("x-openclaw-agent-id", "main")
        .json(&body);
    if let Some(token) = state.settings.local.token.as_deref() {
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            let _ = send_event(&tx, json!({ "error": format!("local gateway error: {err}") })).await;
            send_done(&tx).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        let _ = send_event(
            &tx,
            json!({ "error": format!("local gateway HTTP {status}: {detail}") }),
        )
        .await;
        send_done(&tx).await;
        return;
    }

    // Re-envelope the upstream SSE stream line by line.
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("local gateway stream ended early: {err}");
                break;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break 'outer;
            }

            let Ok(parsed) = serde_json::from_str::<CompletionChunk>(data) else {
                continue;
            };
            let Some(choice) = parsed.choices.first() else {
                continue;
            };
            if !choice.delta.content.is_empty()
                && send_event(&tx, json!({ "delta": choice.delta.content }))
                    .await
                    .is_err()
            {
                return;
            }
        }
    }

    send_done(&tx).await;
    debug!("local gateway chat completed");
}
