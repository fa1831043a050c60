pub use front::{ClientEvent, TransportFront};

mod front;
