use bytes::{Buf, BytesMut};

use crate::signal::SignalDocument;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Width of the wire header: the payload byte count rendered as exactly
/// eight ASCII decimal digits, zero-padded on the left. The width is fixed
/// for the protocol's lifetime so a reader always knows how many bytes to
/// read next.
pub const HEADER_WIDTH: usize = 8;

const HEADER_MAX: usize = 99_999_999;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size: max_frame_size.min(HEADER_MAX),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Prefixes the payload with its zero-padded byte count.
    pub fn encode(&self, payload: &[u8]) -> AppResult<BytesMut> {
        if payload.len() > self.max_frame_size {
            return Err(AppError::FrameTooLarge(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_frame_size
            )));
        }
        let mut frame = BytesMut::with_capacity(HEADER_WIDTH + payload.len());
        frame.extend_from_slice(format!("{:08}", payload.len()).as_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Reads the declared payload length out of a header. Only the digits
    /// '0'..='9' are accepted; stray padding, signs or whitespace fail the
    /// frame. A length above the configured maximum fails closed before
    /// anything is allocated for the payload.
    pub fn decode_header(&self, header: &[u8]) -> AppResult<usize> {
        if header.len() != HEADER_WIDTH {
            return Err(AppError::FormatError(format!(
                "header must be exactly {} bytes, got {}",
                HEADER_WIDTH,
                header.len()
            )));
        }
        let mut declared = 0usize;
        for &byte in header {
            if !byte.is_ascii_digit() {
                return Err(AppError::FormatError(format!(
                    "header byte {:#04x} is not a decimal digit",
                    byte
                )));
            }
            declared = declared * 10 + (byte - b'0') as usize;
        }
        if declared > self.max_frame_size {
            return Err(AppError::FrameTooLarge(format!(
                "declared length {} exceeds the {} byte limit",
                declared, self.max_frame_size
            )));
        }
        Ok(declared)
    }

    /// Parses a payload that must be exactly `declared_len` bytes long.
    pub fn decode_payload(&self, payload: &[u8], declared_len: usize) -> AppResult<SignalDocument> {
        if payload.len() != declared_len {
            return Err(AppError::FormatError(format!(
                "payload is {} bytes but the header declared {}",
                payload.len(),
                declared_len
            )));
        }
        SignalDocument::parse(payload)
    }
}

#[derive(Debug)]
pub struct SignalFrame {
    pub payload: BytesMut,
}

impl SignalFrame {
    pub fn check(buffer: &mut BytesMut, codec: &FrameCodec) -> AppResult<()> {
        if buffer.remaining() < HEADER_WIDTH {
            return Err(Incomplete);
        }
        let declared = codec.decode_header(buffer.get(0..HEADER_WIDTH).unwrap())?;
        if buffer.remaining() < declared + HEADER_WIDTH {
            buffer.reserve(declared + HEADER_WIDTH);
            return Err(Incomplete);
        }
        Ok(())
    }

    /// Consumes exactly one frame from the buffer. Bytes belonging to any
    /// following coalesced frame are left in place for the next call.
    pub(crate) fn parse(
        buffer: &mut BytesMut,
        codec: &FrameCodec,
    ) -> AppResult<Option<SignalFrame>> {
        match SignalFrame::check(buffer, codec) {
            Ok(_) => {
                let header = buffer.split_to(HEADER_WIDTH);
                let declared = codec.decode_header(&header)?;
                let payload = buffer.split_to(declared);
                Ok(Some(SignalFrame { payload }))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn document(&self) -> AppResult<SignalDocument> {
        SignalDocument::parse(&self.payload)
    }
}
