//! Notification WebSocket message types.

use serde::{Deserialize, Serialize};

/// Server-to-client frames on the notification socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    Notification {
        id: String,
        #[serde(rename = "notificationType")]
        kind: String,
        title: String,
        message: String,
        timestamp: i64,
    },
    Ping {
        timestamp: i64,
    },
}

/// Client-to-server frames. Anything that does not parse is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyCommand {
    /// Binds this connection to an instance id for targeted delivery.
    Identify {
        #[serde(default, rename = "instanceId")]
        instance_id: Option<String>,
    },
}
