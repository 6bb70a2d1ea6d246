//! WebSocket signaling server

use super::handler::handle_connection;
use crate::backend::{BackendConnector, ClientHandle};
use crate::config::SignalingConfig;
use crate::session::SignalingContext;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket signaling server
pub struct SignalingServer {
    ctx: SignalingContext,
}

impl SignalingServer {
    /// Create a server whose sessions share one lazily connected backend
    pub fn new(config: SignalingConfig, connector: Arc<dyn BackendConnector>) -> Result<Self> {
        config.validate()?;

        let handle = Arc::new(ClientHandle::new(config.backend_url.clone(), connector));
        Ok(Self {
            ctx: SignalingContext::new(handle, Arc::new(config)),
        })
    }

    /// Shared session state (registry, backend handle, config)
    pub fn context(&self) -> &SignalingContext {
        &self.ctx
    }

    /// Bind the listener and start accepting connections
    ///
    /// Returns once the socket is bound. Use port 0 in `listen_addr` to let
    /// the OS pick one; [`SignalingServerHandle::local_addr`] reports it.
    pub async fn start(self) -> Result<SignalingServerHandle> {
        let listener = TcpListener::bind(&self.ctx.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Signaling server listening on ws://{}{}",
            local_addr, self.ctx.config.path
        );

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let ctx = self.ctx.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let ctx = ctx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, ctx).await {
                                        error!("Connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Signaling server received shutdown signal");
                        break;
                    }
                }
            }

            info!("Signaling server accept loop exited");
        });

        Ok(SignalingServerHandle {
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Handle for shutting down a running server
pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl SignalingServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit
    ///
    /// Connections already open keep running until their clients leave.
    pub async fn shutdown(mut self) {
        info!("Shutting down signaling server");
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Signaling server task failed: {}", e);
            }
        }
    }
}

impl Drop for SignalingServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
