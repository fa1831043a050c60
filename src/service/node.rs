use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{broadcast, mpsc};
use tokio::{runtime, signal};
use tracing::{error, info, trace};

use crate::network::{FrameCodec, SessionRegistry};
use crate::signal::{Dispatcher, SignalHandler};
use crate::AppError::IllegalStateError;
use crate::AppResult;

use super::{TransportConfig, TransportServer};

/// Server-lifecycle owner: builds the runtime, binds the listener, runs
/// the transport server until ctrl_c and then drives the graceful
/// shutdown sequence.
//
// Graceful shutdown sequence:
// 1. The accept loop is cancelled by the ctrl_c arm of the select.
// 2. `notify_shutdown` fires; every connection handler stops reading new
//    frames, resolves its close reason and unregisters its session.
// 3. The signal worker monitor exits on the same broadcast; the workers
//    drain once the dispatcher (the only sender) is dropped.
// 4. Once every connection handler has dropped its `shutdown_complete_tx`
//    clone, the completion receiver resolves and `start` returns.
pub struct ServerNode {
    config: TransportConfig,
}

impl ServerNode {
    pub fn new(config: TransportConfig) -> Self {
        ServerNode { config }
    }

    pub fn start<H: SignalHandler>(&self, handler: Arc<H>) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

        rt.block_on(Self::run_transport(
            self.config.clone(),
            handler,
            notify_shutdown.clone(),
            shutdown_complete_tx,
            &mut shutdown_complete_rx,
        ))?;

        // the accept loop is gone, tell everything else to wind down
        let _ = notify_shutdown.send(());
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("transport node shutdown complete");
        Ok(())
    }

    async fn run_transport<H: SignalHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: Sender<()>,
        _shutdown_complete_rx: &mut Receiver<()>,
    ) -> AppResult<()> {
        let listen_address = format!("{}:{}", config.network.ip, config.network.port);

        let listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            IllegalStateError(error_msg)
        })?;
        info!("transport server binding to {} for listening", &listen_address);

        let codec = FrameCodec::new(config.network.max_frame_size);
        let registry = Arc::new(SessionRegistry::new(codec));
        let dispatcher = Arc::new(Dispatcher::new(
            handler,
            registry.clone(),
            &config.dispatcher_pool,
            notify_shutdown.clone(),
        ));

        let server = TransportServer::new(
            listener,
            config.network.clone(),
            registry,
            dispatcher,
            notify_shutdown,
            shutdown_complete_tx,
        );

        tokio::select! {
            res = server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = signal::ctrl_c() => {
                info!("get shutdown signal");
            }
        }

        Ok(())
    }
}
