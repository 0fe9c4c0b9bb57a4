//! TCP accept loop for bridge connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::{TcpListener, TcpStream};

use super::registry::BridgeRegistry;
use super::session::{self, BridgeSession};

/// Bind the bridge listener. A bind failure is fatal for the process.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding bridge listener on {addr}"))
}

/// Accept bridge connections forever.
///
/// Each connection gets its own handshake-and-serve task so a slow or
/// hostile peer cannot hold up the accept loop.
pub async fn run(listener: TcpListener, registry: Arc<BridgeRegistry>, token: String) {
    if let Ok(addr) = listener.local_addr() {
        info!("bridge listener on {addr}");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("bridge connection from {peer}");
                let registry = registry.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    serve_connection(stream, registry, token).await;
                });
            }
            Err(err) => {
                warn!("bridge accept failed: {err}");
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, registry: Arc<BridgeRegistry>, token: String) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (session, reader) = match BridgeSession::handshake(stream, &token).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!("bridge handshake from {peer} failed: {err}");
            return;
        }
    };

    let session = Arc::new(session);
    registry.insert(session.clone());
    session::run_read_loop(session, reader, registry).await;
}
