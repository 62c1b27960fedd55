//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][JSON envelope]
//! Maximum frame size: 1MB (sanity limit)
//!
//! TCP delivers a byte stream, so a single read may carry half a frame or
//! several frames at once. [`FrameDecoder`] buffers chunks and hands back
//! complete frames in order.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, Error, Result};
use crate::protocol::{Envelope, PROTOCOL_VERSION};

/// Maximum allowed frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes
const HEADER_LEN: usize = 4;

/// Encode an envelope as one complete frame, length prefix included
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = envelope.to_bytes().map_err(Error::Encode)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame payload (without its length prefix)
pub fn decode(payload: &[u8]) -> std::result::Result<Envelope, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let envelope = Envelope::from_bytes(payload)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(envelope.v));
    }

    Ok(envelope)
}

/// Write a pre-encoded frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}

/// Incremental frame decoder fed with arbitrary byte chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for the rest of a frame
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A payload that fails to
    /// decode is consumed and reported as `Err(Error::Decode(..))`, so the
    /// next call starts at the following frame. An oversized length prefix
    /// is `Err(Error::FrameTooLarge(..))` and leaves the stream unusable.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut len_buf = [0u8; HEADER_LEN];
        len_buf.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(len_buf) as usize;

        // Sanity check
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + len).collect();
        decode(&frame[HEADER_LEN..]).map(Some).map_err(Error::from)
    }
}
