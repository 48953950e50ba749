use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::server::connection::Connection;
use crate::server::reaper::Reaper;
use crate::server::service::StoreService;
use crate::store::LocalStore;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors raised while starting a server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// TCP server exposing a [`LocalStore`] over the store protocol.
pub struct Server<S> {
    listener: TcpListener,
    next_conn_id: AtomicU64,
    service: Arc<StoreService<S>>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl<S: LocalStore + 'static> Server<S> {
    /// Validates `config` and binds the listening socket on all interfaces.
    pub async fn bind(config: ServerConfig, store: S) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        Ok(Self::new(listener, config, Arc::new(store)))
    }

    /// Creates a new server with a given listener and store.
    pub fn new(listener: TcpListener, config: ServerConfig, store: Arc<S>) -> Self {
        let service = Arc::new(StoreService::new(
            store,
            config.tid_block_size,
            config.txn_timeout,
        ));
        Self {
            listener,
            next_conn_id: AtomicU64::new(1),
            service,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn service(&self) -> &Arc<StoreService<S>> {
        &self.service
    }

    /// Token that stops the accept loop, the reaper and every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the reaper and serves clients until shut down.
    pub async fn serve(self) -> Result<(), io::Error> {
        let reaper = Reaper::new(
            self.service.clone(),
            self.config.reap_delay,
            self.config.txn_timeout,
        );
        tokio::spawn(reaper.run(self.shutdown.child_token()));

        info!(addr = %self.listener.local_addr()?, "store server listening");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.cancelled() => {
                    info!("store server shutting down");
                    return Ok(());
                }
            };

            let (socket, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually transient, e.g. out of file descriptors.
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!(error = %e, "failed to set TCP_NODELAY");
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let service = self.service.clone();
            let cancel_token = self.shutdown.child_token();
            info!(conn_id, %peer_addr, "accepted connection");

            tokio::spawn(async move {
                let mut connection = Connection::new(socket, conn_id, service);
                if let Err(e) = connection.run(cancel_token).await {
                    warn!(conn_id, error = %e, "connection error");
                }
                info!(conn_id, "connection closed");
            });
        }
    }
}
