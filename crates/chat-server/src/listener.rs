//! TCP listener and accept loop.
//!
//! [`start_server`] binds the configured address, spawns the accept loop and
//! returns a [`ServerHandle`]. Every accepted connection runs as its own
//! [`Session`] task with a child of the server's cancellation token, so
//! cancelling the server closes every session through its normal teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatterbox_core::config::ServerConfig;
use chatterbox_core::registry::{SharedRegistry, new_registry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::session::Session;

/// Pause after a failed `accept` before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A handle to the running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: SharedRegistry,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    sessions: TaskTracker,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared registry used by every session.
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Stop accepting, close every session and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_task.await {
            error!("Accept loop panicked: {e}");
        }
        self.sessions.close();
        self.sessions.wait().await;
        info!("Server stopped");
    }
}

/// Bind the configured address and start accepting connections.
///
/// The server runs until `cancel` is cancelled or [`ServerHandle::shutdown`]
/// is called.
pub async fn start_server(config: ServerConfig, cancel: CancellationToken) -> Result<ServerHandle> {
    let address = config.listen.address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read bound address")?;
    info!("chatterbox listening on {local_addr}");

    let registry = new_registry();
    let sessions = TaskTracker::new();
    let accept_task = tokio::spawn(run_accept_loop(
        listener,
        Arc::new(config),
        registry.clone(),
        sessions.clone(),
        cancel.clone(),
    ));

    Ok(ServerHandle {
        local_addr,
        registry,
        cancel,
        accept_task,
        sessions,
    })
}

async fn run_accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    registry: SharedRegistry,
    sessions: TaskTracker,
    cancel: CancellationToken,
) {
    info!("Accept loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!(%peer, "New connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, "Failed to set TCP_NODELAY: {e}");
                        }
                        let session = Session::new(
                            peer,
                            registry.clone(),
                            &config,
                            cancel.child_token(),
                        );
                        sessions.spawn(async move {
                            if let Err(e) = session.run(stream).await {
                                warn!(%peer, "Session ended early: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    info!("Accept loop stopped");
}
