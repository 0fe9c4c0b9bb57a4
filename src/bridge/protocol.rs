//! Bridge wire protocol types.
//!
//! Defines the frames exchanged with bridge agents over the TCP link.
//! Frames are JSON objects discriminated by a `type` field; payload
//! fields use camelCase on the wire.

use serde::{Deserialize, Serialize};

/// A frame on the bridge socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame a bridge sends after connecting.
    Register(RegisterFrame),

    /// Liveness signal from the bridge.
    Heartbeat,

    /// Chat request forwarded from a client to the bridge.
    ChatRequest(ChatRequestFrame),

    /// Incremental chat reply from the bridge.
    ChatResponse(ChatResponseFrame),

    /// Terminal error for an in-flight chat request.
    ChatError(ChatErrorFrame),

    /// File artifact produced while serving a chat request.
    FileResponse(FileResponseFrame),
}

impl Frame {
    /// The wire tag of this frame, for log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Register(_) => "register",
            Frame::Heartbeat => "heartbeat",
            Frame::ChatRequest(_) => "chat_request",
            Frame::ChatResponse(_) => "chat_response",
            Frame::ChatError(_) => "chat_error",
            Frame::FileResponse(_) => "file_response",
        }
    }
}

// ============================================================================
// Frame payloads
// ============================================================================

/// Registration handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFrame {
    /// Display name the bridge registers under.
    pub name: String,
    /// Shared secret; must match the server's configured bridge token.
    pub token: String,
}

/// Chat request sent to a bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestFrame {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    /// Caller label forwarded to the bridge, may be empty.
    #[serde(default)]
    pub user: String,
}

/// One delta of a streamed chat reply.
///
/// `done` marks the end of the delta stream; file frames for the same
/// request may still follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponseFrame {
    pub request_id: String,
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub done: bool,
}

/// Terminal error for a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatErrorFrame {
    pub request_id: String,
    pub error: String,
}

/// File artifact emitted by the bridge while (or after) answering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponseFrame {
    pub request_id: String,
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_frame_round_trip() {
        let json = r#"{"type":"register","name":"living-room","token":"s3cret"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match &frame {
            Frame::Register(reg) => {
                assert_eq!(reg.name, "living-room");
                assert_eq!(reg.token, "s3cret");
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let out = serde_json::to_string(&frame).unwrap();
        assert!(out.contains(r#""type":"register""#));
    }

    #[test]
    fn test_heartbeat_is_bare() {
        let frame: Frame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, Frame::Heartbeat));
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"heartbeat"}"#
        );
    }

    #[test]
    fn test_chat_request_uses_camel_case() {
        let frame = Frame::ChatRequest(ChatRequestFrame {
            request_id: "req-1".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            user: String::new(),
        });

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"chat_request""#));
        assert!(json.contains(r#""requestId":"req-1""#));
        assert!(json.contains(r#""role":"user""#));
    }

    #[test]
    fn test_chat_response_defaults() {
        let frame: Frame =
            serde_json::from_str(r#"{"type":"chat_response","requestId":"req-9"}"#).unwrap();
        match frame {
            Frame::ChatResponse(resp) => {
                assert_eq!(resp.request_id, "req-9");
                assert_eq!(resp.delta, "");
                assert!(!resp.done);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_file_response_round_trip() {
        let json = r#"{"type":"file_response","requestId":"req-2","url":"/files/a.png","filename":"a.png","size":2048}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::FileResponse(file) => {
                assert_eq!(file.filename, "a.png");
                assert_eq!(file.size, 2048);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = serde_json::from_str::<Frame>(r#"{"type":"telemetry"}"#);
        assert!(err.is_err());
    }
}
