//! Registry of live bridge sessions.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::warn;
use tokio::task::JoinHandle;

use super::session::{BridgeSession, InstanceInfo};

/// How often the supervisor sweeps the registry.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A bridge silent for longer than this is evicted. Application-level
/// liveness; OS keepalive is far too coarse for mobile/NAT links.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(60);

/// Concurrent map `instanceId -> session`.
#[derive(Default)]
pub struct BridgeRegistry {
    sessions: DashMap<String, Arc<BridgeSession>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session after a successful handshake.
    pub fn insert(&self, session: Arc<BridgeSession>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    /// Look up a live session.
    pub fn get(&self, id: &str) -> Option<Arc<BridgeSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session. Idempotent.
    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Shallow copies for the client-facing instance list.
    pub fn list(&self) -> Vec<InstanceInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask every session's read loop to exit. Used on shutdown.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }

    fn stale_sessions(&self, ttl: Duration) -> Vec<Arc<BridgeSession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_stale(ttl))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Evict sessions whose heartbeat lapsed.
///
/// Eviction only closes the session; the read loop's cleanup path does
/// the unregistering so there is a single teardown route.
pub fn spawn_heartbeat_supervisor(registry: Arc<BridgeRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // first tick is immediate

        loop {
            ticker.tick().await;
            for session in registry.stale_sessions(HEARTBEAT_TTL) {
                warn!(
                    "bridge heartbeat lapsed: {} ({}), closing",
                    session.name(),
                    session.id()
                );
                session.mark_offline();
                session.close();
            }
        }
    })
}
