//! Per-session registry of in-flight request channels.
//!
//! Inbound frames from a bridge carry a `requestId`; this registry routes
//! each one to the channel set owned by the client request that is
//! waiting for it. Each request owns three streams: ordered deltas, a
//! single terminal error slot, and file artifacts that may outlive the
//! delta stream.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::{ChatErrorFrame, ChatResponseFrame, FileResponseFrame};

/// Buffered deltas per request.
pub const DELTA_BUFFER_SIZE: usize = 16;

/// Buffered file events per request.
pub const FILE_BUFFER_SIZE: usize = 8;

/// The error channel is terminal, one slot is enough.
pub const ERROR_BUFFER_SIZE: usize = 1;

/// Registering the same request id twice on one session.
#[derive(Debug, Error)]
#[error("request {0} is already registered")]
pub struct DuplicateRequest(pub String);

/// Sender half of a request's channel set, held by the registry.
struct RequestChannels {
    delta: mpsc::Sender<ChatResponseFrame>,
    error: mpsc::Sender<ChatErrorFrame>,
    file: mpsc::Sender<FileResponseFrame>,
}

/// Receiver half of a request's channel set, handed to the relay.
pub struct RequestStreams {
    pub delta: mpsc::Receiver<ChatResponseFrame>,
    pub error: mpsc::Receiver<ChatErrorFrame>,
    pub file: mpsc::Receiver<FileResponseFrame>,
}

/// Concurrent map `requestId -> channels` for one bridge session.
///
/// Dropping the sender set (on unregister or teardown) closes every
/// receiver the relay holds, which is how relays learn the session died.
#[derive(Default)]
pub struct RequestRegistry {
    channels: DashMap<String, RequestChannels>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert a fresh channel set and return the receivers.
    pub fn register(&self, request_id: &str) -> Result<RequestStreams, DuplicateRequest> {
        let (delta_tx, delta_rx) = mpsc::channel(DELTA_BUFFER_SIZE);
        let (error_tx, error_rx) = mpsc::channel(ERROR_BUFFER_SIZE);
        let (file_tx, file_rx) = mpsc::channel(FILE_BUFFER_SIZE);

        match self.channels.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(DuplicateRequest(request_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RequestChannels {
                    delta: delta_tx,
                    error: error_tx,
                    file: file_tx,
                });
                Ok(RequestStreams {
                    delta: delta_rx,
                    error: error_rx,
                    file: file_rx,
                })
            }
        }
    }

    /// Remove a request; dropping the senders closes its streams.
    pub fn unregister(&self, request_id: &str) {
        self.channels.remove(request_id);
    }

    /// Close every request channel. Used on session teardown so all
    /// dependent relays observe the disconnect.
    pub fn close_all(&self) {
        self.channels.clear();
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Route a delta frame to its request, without blocking the read loop.
    pub fn dispatch_response(&self, frame: ChatResponseFrame) {
        let Some(channels) = self.channels.get(&frame.request_id) else {
            debug!("dropping late chat_response for {}", frame.request_id);
            return;
        };
        if let Err(err) = channels.delta.try_send(frame) {
            log_dropped("chat_response", err);
        }
    }

    /// Route an error frame to its request.
    pub fn dispatch_error(&self, frame: ChatErrorFrame) {
        let Some(channels) = self.channels.get(&frame.request_id) else {
            debug!("dropping late chat_error for {}", frame.request_id);
            return;
        };
        if let Err(err) = channels.error.try_send(frame) {
            log_dropped("chat_error", err);
        }
    }

    /// Route a file frame to its request.
    pub fn dispatch_file(&self, frame: FileResponseFrame) {
        let Some(channels) = self.channels.get(&frame.request_id) else {
            debug!("dropping late file_response for {}", frame.request_id);
            return;
        };
        if let Err(err) = channels.file.try_send(frame) {
            log_dropped("file_response", err);
        }
    }
}

fn log_dropped<T>(kind: &str, err: TrySendError<T>) {
    match err {
        TrySendError::Full(_) => warn!("{kind} buffer full, frame dropped"),
        TrySendError::Closed(_) => debug!("{kind} receiver gone, frame dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: &str, delta: &str) -> ChatResponseFrame {
        ChatResponseFrame {
            request_id: request_id.to_string(),
            delta: delta.to_string(),
            done: false,
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_matching_request() {
        let registry = RequestRegistry::new();
        let mut first = registry.register("req-1").unwrap();
        let mut second = registry.register("req-2").unwrap();

        registry.dispatch_response(response("req-1", "a"));
        registry.dispatch_response(response("req-2", "b"));

        assert_eq!(first.delta.recv().await.unwrap().delta, "a");
        assert_eq!(second.delta.recv().await.unwrap().delta, "b");
        assert!(first.delta.try_recv().is_err());
    }

    #[test]
    fn test_double_register_is_an_error() {
        let registry = RequestRegistry::new();
        let _streams = registry.register("req-1").unwrap();
        assert!(registry.register("req-1").is_err());
    }

    #[tokio::test]
    async fn test_unregister_closes_streams() {
        let registry = RequestRegistry::new();
        let mut streams = registry.register("req-1").unwrap();

        registry.unregister("req-1");

        assert!(streams.delta.recv().await.is_none());
        assert!(streams.error.recv().await.is_none());
        assert!(streams.file.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_closes_every_request() {
        let registry = RequestRegistry::new();
        let mut first = registry.register("req-1").unwrap();
        let mut second = registry.register("req-2").unwrap();

        registry.close_all();

        assert!(first.delta.recv().await.is_none());
        assert!(second.delta.recv().await.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_request_is_dropped_silently() {
        let registry = RequestRegistry::new();
        // Must not panic or block.
        registry.dispatch_response(response("nope", "x"));
    }

    #[test]
    fn test_full_delta_buffer_drops_frame() {
        let registry = RequestRegistry::new();
        let mut streams = registry.register("req-1").unwrap();

        for _ in 0..DELTA_BUFFER_SIZE {
            registry.dispatch_response(response("req-1", "x"));
        }
        // Buffer now full; this one is dropped rather than blocking.
        registry.dispatch_response(response("req-1", "overflow"));

        let mut received = 0;
        while streams.delta.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, DELTA_BUFFER_SIZE);
    }
}
