use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::network::{FrameCodec, WriterHandle};
use crate::signal::SignalDocument;
use crate::{AppError, AppResult};

/// Opaque identity of one connected peer. Ids are allocated from a
/// monotonically increasing counter and never reassigned after removal,
/// so a caller holding a stale id can never be routed to a different peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Server-side bookkeeping for one connected peer.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Registry-authoritative client identity, stamped onto every inbound
    /// envelope before routing. Claimed identities on inbound data are
    /// never trusted.
    pub client_id: String,
    pub peer_addr: String,
    writer: WriterHandle,
}

impl Session {
    pub fn send_frame(&self, frame: bytes::Bytes) -> AppResult<()> {
        self.writer.send(frame)
    }

    pub fn close(&self, graceful: bool) {
        self.writer.close(graceful)
    }
}

/// Tracks every live connection plus its session identity.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    codec: FrameCodec,
}

impl SessionRegistry {
    pub fn new(codec: FrameCodec) -> SessionRegistry {
        SessionRegistry {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            codec,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn register(&self, peer_addr: String, writer: WriterHandle) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session {
            id,
            client_id: format!("client-{}", id.raw()),
            peer_addr,
            writer,
        });
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Sends one document to one session. Failing with `UnknownSession` is
    /// a legitimate race when the peer disconnected between the caller's
    /// decision and this call; it is reported, never silently dropped.
    pub fn send_to(&self, id: SessionId, payload: &SignalDocument) -> AppResult<()> {
        let session = self
            .lookup(id)
            .ok_or(AppError::UnknownSession(id.raw()))?;
        let frame = self.codec.encode(&payload.encode())?;
        session.send_frame(frame.freeze())
    }

    /// Sends one document to every registered session except `exclude`.
    /// A session dying mid-sweep is logged and does not abort the sweep.
    pub fn broadcast(&self, payload: &SignalDocument, exclude: Option<SessionId>) -> AppResult<()> {
        let frame = self.codec.encode(&payload.encode())?.freeze();
        for entry in self.sessions.iter() {
            if Some(*entry.key()) == exclude {
                continue;
            }
            if let Err(e) = entry.value().send_frame(frame.clone()) {
                warn!("broadcast to {} failed: {}", entry.key(), e);
            }
        }
        Ok(())
    }
}
