use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::network::{spawn_writer, CloseReason, Connection, SessionId, SessionRegistry};
use crate::signal::Dispatcher;
use crate::AppError;
use crate::AppResult;

use super::NetworkConfig;
use super::Shutdown;

// handler for each connection
struct ConnectionHandler {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    session_id: SessionId,
    connection: Connection,
    dispatcher: Arc<Dispatcher>,
}

impl ConnectionHandler {
    /// Resolves the single close reason for this peer. Exactly one reason
    /// comes out of every established connection, whichever way it ends.
    async fn handle_connection(&mut self) -> CloseReason {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        loop {
            // read signals from the peer; a graceful close yields None and
            // an abnormal one an error
            let result = tokio::select! {
                res = self.connection.read_frame() => res,
                _ = shutdown.recv() => {
                    debug!("{} read loop exits on shutdown signal", self.session_id);
                    return CloseReason::LocalClose;
                }
            };

            let frame = match result {
                Ok(Some(frame)) => frame,
                Ok(None) => return CloseReason::PeerClose,
                Err(e) => {
                    error!("{} transport fault: {}", self.session_id, e);
                    return CloseReason::Faulted;
                }
            };

            // a frame that cannot be decoded has desynchronized the byte
            // stream; it cannot be skipped, only closed on
            if let Err(e) = self.dispatcher.dispatch(self.session_id, frame).await {
                error!("{} dispatch failed: {}", self.session_id, e);
                return CloseReason::Faulted;
            }
        }
    }
}

/// Accepts new peers, runs one `ConnectionHandler` per peer and removes
/// the session again when its connection reports closure. Transport
/// failures tear down exactly one connection and never the accept loop.
#[derive(Debug)]
pub struct TransportServer {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    network: NetworkConfig,
}

impl TransportServer {
    pub fn new(
        listener: TcpListener,
        network: NetworkConfig,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        TransportServer {
            listener,
            limit_connections: Arc::new(Semaphore::new(network.max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            registry,
            dispatcher,
            network,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accepts connections until the listener fails or the caller drops
    /// the surrounding select. Each accepted peer gets a session identity,
    /// a dedicated writer task and a read loop of its own.
    pub async fn run(&self) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = self.accept().await?;
            let peer_addr = socket
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());

            let (reader, writer) = socket.into_split();
            let (writer_handle, _writer_task) = spawn_writer(writer);
            let session = self.registry.register(peer_addr, writer_handle);
            info!("accepted {} as {}", session.peer_addr, session.id);

            let mut handler = ConnectionHandler {
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
                notify_shutdown: self.notify_shutdown.clone(),
                session_id: session.id,
                connection: Connection::new(
                    reader,
                    self.registry.codec(),
                    self.network.conn_read_buffer_size,
                ),
                dispatcher: self.dispatcher.clone(),
            };

            let registry = self.registry.clone();
            tokio::spawn(async move {
                let reason = handler.handle_connection().await;
                // the session dies exactly once, here
                if let Some(session) = registry.unregister(handler.session_id) {
                    session.close(matches!(reason, CloseReason::LocalClose));
                    info!("{} closed: {:?}", session.id, reason);
                }
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        debug!("transport server dropped");
    }
}
