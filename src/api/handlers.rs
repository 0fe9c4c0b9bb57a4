//! JSON API handlers.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::bridge::{InstanceInfo, InstanceStatus};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// GET / — service summary.
pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "voxrelay",
        "status": "ok",
        "health": "/health",
        "apis": [
            "/api/instances",
            "/api/chat",
            "/api/stt/stream",
            "/api/notifications/ws",
            "/api/notify",
            "/api/fcm/register",
            "/api/fcm/push",
        ],
        "timestamp": Utc::now(),
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "instances": state.bridges.len(),
    }))
}

/// GET /api/instances
///
/// When the local gateway is configured it is listed first as a
/// synthetic, always-online instance.
pub async fn instances(State(state): State<AppState>) -> Json<Vec<InstanceInfo>> {
    let mut list = state.bridges.list();

    if state.settings.local_gateway_enabled() {
        list.insert(
            0,
            InstanceInfo {
                id: "local".to_string(),
                name: state.settings.local.name.clone(),
                status: InstanceStatus::Online,
                connected_at: Utc::now(),
            },
        );
    }

    Json(list)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Deep link or similar, forwarded untouched in the future; accepted
    /// so callers do not get rejected for sending it.
    #[serde(default)]
    pub action: Option<String>,
}

/// POST /api/notify
///
/// Delivers over the WebSocket hub; when nobody is listening, falls back
/// to push exactly once.
pub async fn notify(
    State(state): State<AppState>,
    Json(req): Json<NotifyRequest>,
) -> ApiResult<Json<Value>> {
    if req.title.is_empty() && req.body.is_empty() {
        return Err(ApiError::bad_request("title or body required"));
    }

    let sent = state
        .notifications
        .send_to(&req.instance_id, "info", &req.title, &req.body);

    let mut fcm_sent = 0;
    if sent == 0 {
        let result = if req.instance_id.is_empty() {
            state.push.send(&req.title, &req.body).await
        } else {
            state.push.send_to(&req.instance_id, &req.title, &req.body).await
        };
        match result {
            Ok(()) => fcm_sent = 1,
            Err(err) => warn!("push fallback failed: {err:#}"),
        }
    }

    Ok(Json(json!({ "sent": sent, "fcmSent": fcm_sent })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPushTokenRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub instance_id: String,
}

/// POST /api/fcm/register
pub async fn register_push_token(
    State(state): State<AppState>,
    Json(req): Json<RegisterPushTokenRequest>,
) -> ApiResult<Json<Value>> {
    if req.token.is_empty() {
        return Err(ApiError::bad_request("Missing token"));
    }
    state.push.register_token(&req.instance_id, &req.token);
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPushRequest {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

/// POST /api/fcm/push — direct push, no WebSocket attempt.
pub async fn send_push(
    State(state): State<AppState>,
    Json(req): Json<SendPushRequest>,
) -> ApiResult<Json<Value>> {
    let result = if req.instance_id.is_empty() {
        state.push.send(&req.title, &req.message).await
    } else {
        state.push.send_to(&req.instance_id, &req.title, &req.message).await
    };

    result.map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}
