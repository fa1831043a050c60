mod client;
mod network;
mod service;
mod signal;

pub use client::{ClientEvent, TransportFront};
pub use network::{
    spawn_writer, CloseReason, Connection, FrameCodec, Session, SessionId, SessionRegistry,
    SignalFrame, WriterHandle, HEADER_WIDTH,
};
pub use service::GLOBAL_CONFIG;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, DispatcherPool,
    LogGuard, NetworkConfig, ServerNode, Shutdown, TransportConfig, TransportServer,
};
pub use signal::{
    is_reply, Dispatcher, Envelope, SignalDocument, SignalHandler, UnroutedHandler, REPLY_MARKER,
};
