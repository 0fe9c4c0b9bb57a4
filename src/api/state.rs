//! Application state shared across handlers.

use std::sync::Arc;

use crate::bridge::BridgeRegistry;
use crate::notify::NotificationHub;
use crate::push::PushGateway;
use crate::settings::Settings;
use crate::stt::SttProxy;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub bridges: Arc<BridgeRegistry>,
    pub notifications: Arc<NotificationHub>,
    pub push: Arc<PushGateway>,
    pub stt: Arc<SttProxy>,
    /// Client for the local-gateway bypass.
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        bridges: Arc<BridgeRegistry>,
        notifications: Arc<NotificationHub>,
        push: Arc<PushGateway>,
        stt: Arc<SttProxy>,
    ) -> Self {
        Self {
            settings,
            bridges,
            notifications,
            push,
            stt,
            http_client: reqwest::Client::new(),
        }
    }
}
