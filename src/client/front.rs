use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::network::{spawn_writer, CloseReason, Connection, FrameCodec, WriterHandle};
use crate::signal::{is_reply, Envelope, SignalDocument};
use crate::{AppError, AppResult};

/// Everything the client-lifecycle owner can observe, in the order it
/// happened. Socket I/O never runs on the owner's execution context; it
/// consumes these from the event receiver instead.
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    ConnectFailed(String),
    Frame(SignalDocument),
    /// Fired exactly once per established connection. `LocalClose` means
    /// the owner asked for it; `PeerClose` means the server dropped us.
    Closed(CloseReason),
}

#[derive(Debug)]
enum FrontState {
    Idle,
    Connecting(JoinHandle<()>),
    Connected {
        writer: WriterHandle,
        closing: CancellationToken,
    },
}

#[derive(Debug)]
struct FrontShared {
    state: Mutex<FrontState>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Local intent flag, set before the close is initiated so the
    /// closure event never races it.
    local_close: AtomicBool,
    identity: String,
    codec: FrameCodec,
    read_buffer_size: usize,
}

/// Client side of the transport: one outbound connection owned by a
/// dedicated worker task. The caller-facing API only enqueues work and
/// consumes events.
#[derive(Debug)]
pub struct TransportFront {
    shared: Arc<FrontShared>,
}

impl TransportFront {
    pub fn new(
        identity: impl Into<String>,
        codec: FrameCodec,
        read_buffer_size: usize,
    ) -> (TransportFront, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let front = TransportFront {
            shared: Arc::new(FrontShared {
                state: Mutex::new(FrontState::Idle),
                events_tx,
                local_close: AtomicBool::new(false),
                identity: identity.into(),
                codec,
                read_buffer_size,
            }),
        };
        (front, events_rx)
    }

    /// Starts one connection attempt. The outcome arrives as a
    /// `Connected` or `ConnectFailed` event; only one attempt may be in
    /// flight per front, and connecting while connected is refused.
    ///
    /// Must be called from within a tokio runtime: the worker task that
    /// owns the socket is spawned onto it.
    pub fn connect(&self, host: &str, port: u16) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        if matches!(*state, FrontState::Connecting(_)) {
            return Err(AppError::AlreadyConnecting);
        }
        if matches!(*state, FrontState::Connected { .. }) {
            return Err(AppError::IllegalStateError(
                "already connected; disconnect first".to_string(),
            ));
        }

        self.shared.local_close.store(false, Ordering::SeqCst);
        let addr = format!("{}:{}", host, port);
        let task = tokio::spawn(run_connection(self.shared.clone(), addr));
        // the worker cannot reach the state until this lock drops, so
        // Connecting is in place before Connected can be
        *state = FrontState::Connecting(task);
        Ok(())
    }

    /// Enqueues one request document. Each non-reply node is stamped with
    /// this front's identity before it leaves; the server substitutes its
    /// own authoritative identity regardless.
    pub fn send(&self, mut nodes: Vec<Value>) -> AppResult<()> {
        let writer = {
            let state = self.shared.state.lock();
            match &*state {
                FrontState::Connected { writer, .. } => writer.clone(),
                _ => return Err(AppError::NotConnected),
            }
        };

        for node in nodes.iter_mut() {
            if !is_reply(node) {
                Envelope::stamp_clientid(node, &self.shared.identity);
            }
        }
        let doc = SignalDocument::new(nodes)?;
        let frame = self.shared.codec.encode(&doc.encode())?;
        writer.send(frame.freeze())
    }

    /// Requests closure. Graceful lets the writer finish anything already
    /// queued; immediate shuts the socket down now. The worker reports
    /// the final `Closed(LocalClose)` event.
    pub fn disconnect(&self, graceful: bool) {
        let mut state = self.shared.state.lock();
        if matches!(*state, FrontState::Connecting(_)) {
            if let FrontState::Connecting(task) = std::mem::replace(&mut *state, FrontState::Idle)
            {
                task.abort();
                let _ = self
                    .shared
                    .events_tx
                    .send(ClientEvent::ConnectFailed("connect cancelled".to_string()));
            }
            return;
        }
        if let FrontState::Connected { writer, closing } = &*state {
            self.shared.local_close.store(true, Ordering::SeqCst);
            writer.close(graceful);
            closing.cancel();
            // the worker resets the state and emits Closed(LocalClose)
        }
    }
}

impl Drop for TransportFront {
    fn drop(&mut self) {
        self.disconnect(false);
    }
}

async fn run_connection(shared: Arc<FrontShared>, addr: String) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            let mut state = shared.state.lock();
            // a cancelled attempt already reported ConnectFailed
            if matches!(*state, FrontState::Connecting(_)) {
                *state = FrontState::Idle;
                drop(state);
                let _ = shared
                    .events_tx
                    .send(ClientEvent::ConnectFailed(format!("{}: {}", addr, e)));
            }
            return;
        }
    };

    let (reader, write_half) = stream.into_split();
    let (writer, _writer_task) = spawn_writer(write_half);
    let closing = CancellationToken::new();
    {
        let mut state = shared.state.lock();
        if !matches!(*state, FrontState::Connecting(_)) {
            // disconnect cancelled the attempt while the socket was being
            // established; it already emitted ConnectFailed
            writer.close(false);
            return;
        }
        *state = FrontState::Connected {
            writer: writer.clone(),
            closing: closing.clone(),
        };
    }
    let _ = shared.events_tx.send(ClientEvent::Connected);

    let mut connection = Connection::new(reader, shared.codec, shared.read_buffer_size);
    let mut reason = tokio::select! {
        reason = read_loop(&mut connection, &shared) => reason,
        _ = closing.cancelled() => CloseReason::LocalClose,
    };
    if shared.local_close.load(Ordering::SeqCst) {
        reason = CloseReason::LocalClose;
    }
    if !matches!(reason, CloseReason::LocalClose) {
        // disconnect already chose graceful or immediate for local closes
        writer.close(false);
    }

    *shared.state.lock() = FrontState::Idle;
    let _ = shared.events_tx.send(ClientEvent::Closed(reason));
}

async fn read_loop(connection: &mut Connection, shared: &FrontShared) -> CloseReason {
    loop {
        match connection.read_frame().await {
            Ok(Some(frame)) => match frame.document() {
                Ok(doc) => {
                    let _ = shared.events_tx.send(ClientEvent::Frame(doc));
                }
                Err(e) => {
                    error!("inbound frame does not decode: {}", e);
                    return CloseReason::Faulted;
                }
            },
            Ok(None) => return CloseReason::PeerClose,
            Err(e) => {
                debug!("transport fault on client connection: {}", e);
                return CloseReason::Faulted;
            }
        }
    }
}
