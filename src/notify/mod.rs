//! Notification fan-out: WebSocket hub plus message types.

pub mod handler;
pub mod hub;
pub mod types;

pub use hub::NotificationHub;
pub use types::{NotifyCommand, NotifyEvent};
