pub use codec::SignalDocument;
pub use dispatcher::{Dispatcher, SignalHandler, UnroutedHandler};
pub use envelope::{is_reply, Envelope, REPLY_MARKER};

mod codec;
mod dispatcher;
mod envelope;
