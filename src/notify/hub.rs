//! Notification hub: registry of connected notification clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc;

use super::types::NotifyEvent;

/// Per-client send buffer. A full buffer drops the message for that
/// client only.
pub const CLIENT_BUFFER_SIZE: usize = 64;

struct ClientHandle {
    instance_id: RwLock<Option<String>>,
    sender: mpsc::Sender<NotifyEvent>,
}

/// Registry of live notification connections with targeted and
/// broadcast delivery.
#[derive(Default)]
pub struct NotificationHub {
    clients: DashMap<u64, ClientHandle>,
    next_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection; returns its id and event stream.
    pub fn register(&self) -> (u64, mpsc::Receiver<NotifyEvent>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(
            id,
            ClientHandle {
                instance_id: RwLock::new(None),
                sender: tx,
            },
        );
        info!("notification client {} connected (total: {})", id, self.client_count());
        (id, rx)
    }

    /// Drop a connection. Idempotent.
    pub fn unregister(&self, id: u64) {
        if self.clients.remove(&id).is_some() {
            info!(
                "notification client {} disconnected (total: {})",
                id,
                self.client_count()
            );
        }
    }

    /// Bind a connection to an instance id.
    pub fn identify(&self, id: u64, instance_id: String) {
        if let Some(client) = self.clients.get(&id) {
            info!("notification client {} identified as {}", id, instance_id);
            *client.instance_id.write().unwrap() = Some(instance_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver to every client identified as `instance_id`, or to all
    /// clients when `instance_id` is empty. Returns how many clients the
    /// message actually reached; a full client buffer skips that client.
    pub fn send_to(&self, instance_id: &str, kind: &str, title: &str, message: &str) -> usize {
        let now = Utc::now();
        let event = NotifyEvent::Notification {
            id: now.format("%Y%m%d%H%M%S%.3f").to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            timestamp: now.timestamp_millis(),
        };

        let mut reached = 0;
        for entry in self.clients.iter() {
            let matches = instance_id.is_empty()
                || entry
                    .instance_id
                    .read()
                    .unwrap()
                    .as_deref()
                    .is_some_and(|id| id == instance_id);
            if !matches {
                continue;
            }
            match entry.sender.try_send(event.clone()) {
                Ok(()) => reached += 1,
                Err(_) => debug!("notification client buffer full, message skipped"),
            }
        }
        reached
    }

    /// Deliver to every connected client.
    pub fn broadcast(&self, kind: &str, title: &str, message: &str) -> usize {
        self.send_to("", kind, title, message)
    }
}
