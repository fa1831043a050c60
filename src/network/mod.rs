//! Network Module Implementation
//!
//! Everything that touches the wire lives here: the frame codec, the
//! per-peer connection read loop, the dedicated writer task, and the
//! server-side session registry.
//!
//! # Components
//!
//! - `FrameCodec` / `SignalFrame`: fixed-width decimal header + payload
//! - `Connection`: per-peer read state machine over a `BytesMut` buffer
//! - `WriterHandle` / `spawn_writer`: serialized, non-blocking outbound path
//! - `SessionRegistry`: live sessions, never-reused identities, broadcast

pub use connection::{CloseReason, Connection};
pub use frame::{FrameCodec, SignalFrame, HEADER_WIDTH};
pub use session::{Session, SessionId, SessionRegistry};
pub use writer::{spawn_writer, WriterHandle};

mod connection;
mod frame;
mod session;
mod writer;
