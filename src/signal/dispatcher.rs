// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{SessionId, SessionRegistry, SignalFrame};
use crate::service::{DispatcherPool, Shutdown};
use crate::signal::{Envelope, SignalDocument};
use crate::{AppError, AppResult};

/// The routing hook: whatever executes the actual remote operations.
///
/// The dispatcher invokes this from a worker pool, never from the
/// transport's reactor, but the contract still stands on the handler:
/// return quickly and push genuinely long-running work elsewhere.
/// `Err(reason)` becomes a rejection reply to the calling peer.
pub trait SignalHandler: Send + Sync + 'static {
    fn handle_signal(
        &self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> impl std::future::Future<Output = Result<Value, String>> + Send;
}

/// Handler for a transport with no operations wired up yet: every target
/// is rejected with a reason naming it.
pub struct UnroutedHandler;

impl SignalHandler for UnroutedHandler {
    async fn handle_signal(
        &self,
        _session_id: SessionId,
        envelope: Envelope,
    ) -> Result<Value, String> {
        Err(format!(
            "no handler registered for target '{}'",
            envelope.target
        ))
    }
}

#[derive(Debug)]
pub struct DispatchTask {
    session_id: SessionId,
    request_node: Value,
    envelope: Envelope,
    /// Signals the connection's read loop that this frame is fully
    /// handled. The loop awaits it before reading the next frame, which
    /// keeps dispatches on one connection strictly sequential while other
    /// connections proceed on their own workers.
    done_tx: oneshot::Sender<()>,
}

/// Routes decoded frames to the signal handler pool and correlated
/// replies back over the originating session.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    dispatch_tx: async_channel::Sender<DispatchTask>,
}

impl Dispatcher {
    pub fn new<H: SignalHandler>(
        handler: Arc<H>,
        registry: Arc<SessionRegistry>,
        pool_config: &DispatcherPool,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Dispatcher {
        let dispatch_tx =
            start_signal_workers(handler, registry.clone(), pool_config, notify_shutdown);
        Dispatcher {
            registry,
            dispatch_tx,
        }
    }

    /// Decodes the document, validates the envelope, stamps the session's
    /// authoritative client identity and hands off to the worker pool,
    /// then awaits the worker's completion ack so that dispatches on one
    /// connection are never concurrent. The handler owes the other half
    /// of the contract: anything genuinely long-running must move to its
    /// own execution context instead of holding a worker.
    ///
    /// A payload that does not decode is a `FormatError` and bubbles up —
    /// the byte stream is desynchronized and the caller must close the
    /// connection. A decodable payload missing a mandatory field is
    /// answered with a rejection reply and the connection stays open.
    pub async fn dispatch(&self, session_id: SessionId, frame: SignalFrame) -> AppResult<()> {
        let doc = frame.document()?;
        let mut nodes = doc.into_nodes();
        let mut request_node = nodes.swap_remove(0);

        let mut envelope = Envelope::from_node(&request_node);
        if let Some(reason) = envelope.well_formed_error() {
            warn!("{} sent an unroutable signal: {}", session_id, reason);
            let reply_node = Envelope::reply_rejected(&request_node, &reason);
            let reply = SignalDocument::correlated(request_node, reply_node);
            return self.registry.send_to(session_id, &reply);
        }

        let session = self
            .registry
            .lookup(session_id)
            .ok_or(AppError::UnknownSession(session_id.raw()))?;
        Envelope::stamp_clientid(&mut request_node, &session.client_id);
        envelope.clientid = Some(session.client_id.clone());

        let (done_tx, done_rx) = oneshot::channel();
        self.dispatch_tx
            .send(DispatchTask {
                session_id,
                request_node,
                envelope,
                done_tx,
            })
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))?;

        // a worker panicking mid-signal drops the ack; the stream state is
        // then unknowable and the connection must go down with it
        done_rx.await.map_err(|_| {
            AppError::IllegalStateError("signal worker dropped without completing".to_string())
        })
    }
}

fn start_signal_workers<H: SignalHandler>(
    handler: Arc<H>,
    registry: Arc<SessionRegistry>,
    pool_config: &DispatcherPool,
    notify_shutdown: broadcast::Sender<()>,
) -> async_channel::Sender<DispatchTask> {
    let (dispatch_tx, dispatch_rx) = async_channel::bounded(pool_config.channel_capacity);
    let num_workers = pool_config.num_channels.max(1) as usize;
    let monitor_interval = pool_config.monitor_interval;
    let worker_check_timeout = pool_config.worker_check_timeout;

    tokio::spawn(async move {
        // Handler code is an external collaborator: a panic inside it must
        // cost at most one worker, so the monitor respawns casualties.
        let mut workers = HashMap::with_capacity(num_workers);
        for i in 0..num_workers {
            workers.insert(
                i,
                spawn_worker(i, dispatch_rx.clone(), handler.clone(), registry.clone()),
            );
        }

        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("signal worker monitor received shutdown signal");
                    break;
                }
                _ = time::sleep(Duration::from_secs(monitor_interval)) => {}
            }

            for i in 0..num_workers {
                let Some(mut handle) = workers.remove(&i) else {
                    continue;
                };
                match time::timeout(Duration::from_millis(worker_check_timeout), &mut handle).await
                {
                    Ok(Ok(_)) => {
                        info!("signal worker {} exited normally", i);
                    }
                    Ok(Err(join_error)) => {
                        if join_error.is_panic() {
                            let payload = join_error.into_panic();
                            let message = payload
                                .downcast_ref::<&'static str>()
                                .map(|s| s.to_string())
                                .or_else(|| payload.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "unknown panic payload".to_string());
                            error!("signal worker {} panicked: {}", i, message);
                            workers.insert(
                                i,
                                spawn_worker(
                                    i,
                                    dispatch_rx.clone(),
                                    handler.clone(),
                                    registry.clone(),
                                ),
                            );
                        } else {
                            error!("signal worker {} failed for unknown reasons", i);
                        }
                    }
                    Err(_) => {
                        // still running
                        workers.insert(i, handle);
                    }
                }
            }
        }
        debug!("signal worker monitor exited");
    });

    dispatch_tx
}

fn spawn_worker<H: SignalHandler>(
    index: usize,
    dispatch_rx: async_channel::Receiver<DispatchTask>,
    handler: Arc<H>,
    registry: Arc<SessionRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("signal worker {} started", index);
        while let Ok(task) = dispatch_rx.recv().await {
            process_signal(task, handler.as_ref(), &registry).await;
        }
        debug!("signal worker {} exited", index);
    })
}

async fn process_signal<H: SignalHandler>(
    task: DispatchTask,
    handler: &H,
    registry: &SessionRegistry,
) {
    let DispatchTask {
        session_id,
        request_node,
        envelope,
        done_tx,
    } = task;
    let target = envelope.target.clone();

    let reply_node = match handler.handle_signal(session_id, envelope).await {
        Ok(result) => Envelope::reply_ok(&request_node, result),
        Err(reason) => {
            debug!("signal '{}' rejected: {}", target, reason);
            Envelope::reply_rejected(&request_node, &reason)
        }
    };
    let reply = SignalDocument::correlated(request_node, reply_node);

    // losing the race against a disconnect is legitimate, but it is
    // reported here rather than swallowed
    if let Err(e) = registry.send_to(session_id, &reply) {
        warn!(
            "reply for '{}' dropped, {} is gone: {}",
            target, session_id, e
        );
    }
    let _ = done_tx.send(());
}
