//! Frame buffer for accumulating partial reads on stream transports.
//!
//! TCP and Unix-socket bindings precede every frame with a 24-bit big-endian
//! length prefix. This buffer owns a single `BytesMut`, runs a two-state
//! machine (waiting for prefix, waiting for frame bytes) and yields decoded
//! frames as they complete. WebSocket transports skip it entirely: there a
//! frame is one binary message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{self, Frame};
use crate::error::{RSocketError, Result};

/// Length prefix size in bytes.
pub const PREFIX_SIZE: usize = 3;

/// Default maximum frame size accepted from the wire (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// State machine for frame extraction.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 3-byte length prefix.
    WaitingForPrefix,
    /// Prefix parsed, waiting for the frame bytes.
    WaitingForFrame { frame_len: usize },
}

/// Buffer for incoming bytes, extracting complete length-prefixed frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a buffer with the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a buffer with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPrefix,
            max_frame_size,
        }
    }

    /// Push raw bytes and extract all complete frames.
    ///
    /// Frames the codec says to drop silently (unknown type with IGNORE,
    /// misaddressed METADATA_PUSH) are skipped here, so callers only ever
    /// see actionable frames.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    if self.buffer.len() < PREFIX_SIZE {
                        return Ok(None);
                    }
                    let frame_len = self.buffer.get_uint(PREFIX_SIZE) as usize;
                    if frame_len > self.max_frame_size {
                        return Err(RSocketError::MalformedFrame(format!(
                            "frame length {} exceeds maximum {}",
                            frame_len, self.max_frame_size
                        )));
                    }
                    self.state = State::WaitingForFrame { frame_len };
                }
                State::WaitingForFrame { frame_len } => {
                    if self.buffer.len() < frame_len {
                        return Ok(None);
                    }
                    let raw = self.buffer.split_to(frame_len).freeze();
                    self.state = State::WaitingForPrefix;
                    match codec::decode(raw)? {
                        Some(frame) => return Ok(Some(frame)),
                        // Silently dropped frame, keep extracting.
                        None => continue,
                    }
                }
            }
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a frame with its 24-bit length prefix, for stream transports.
pub fn encode_prefixed(frame: &Frame) -> Bytes {
    let encoded = frame.encode();
    let mut buf = BytesMut::with_capacity(PREFIX_SIZE + encoded.len());
    buf.put_uint(encoded.len() as u64, PREFIX_SIZE);
    buf.put_slice(&encoded);
    buf.freeze()
}
