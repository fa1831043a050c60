use std::io::{self, ErrorKind};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::network::{FrameCodec, SignalFrame};
use crate::AppResult;

/// Why a connection stopped existing. Resolved exactly once per
/// established connection, by whichever side owns the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// We asked for the shutdown.
    LocalClose,
    /// The peer closed its end in an orderly way.
    PeerClose,
    /// The transport failed: reset, mid-frame EOF, or a malformed frame
    /// that desynchronized the byte stream.
    Faulted,
}

/// Read side of one peer connection.
///
/// Holds the read half of the socket plus an accumulation buffer. Frames
/// may arrive fragmented across arbitrary TCP segment boundaries or
/// coalesced several to a read; the parse-then-read loop below handles
/// both, and `read_frame` drains buffered frames before touching the
/// socket again so coalesced frames come out in arrival order.
#[derive(Debug)]
pub struct Connection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl Connection {
    pub fn new(reader: OwnedReadHalf, codec: FrameCodec, read_buffer_size: usize) -> Connection {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(read_buffer_size),
            codec,
        }
    }

    /// Reads one `SignalFrame` from the connection.
    ///
    /// Returns `Ok(None)` when the peer closed the connection gracefully
    /// between frames. A close in the middle of a frame is an error, as is
    /// a malformed or oversized header; the caller must treat either as
    /// fatal for this connection.
    pub async fn read_frame(&mut self) -> AppResult<Option<SignalFrame>> {
        loop {
            if let Some(frame) = SignalFrame::parse(&mut self.buffer, &self.codec)? {
                return Ok(Some(frame));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}
