//! Length-prefixed frame transport over any ordered byte stream.
//!
//! Used by the TCP and Unix-socket bindings, and by tests over
//! `tokio::io::duplex`. Each frame travels as a 24-bit big-endian length
//! prefix followed by the frame's header and body.

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use super::BoxIo;
use crate::error::Result;
use crate::frame::{encode_prefixed, Frame, FrameBuffer};

/// Read side: accumulates socket reads and yields decoded frames.
pub struct FramedReader {
    io: ReadHalf<BoxIo>,
    buffer: FrameBuffer,
    pending: VecDeque<Frame>,
    read_buf: Vec<u8>,
}

impl FramedReader {
    pub(crate) fn new(io: ReadHalf<BoxIo>, max_frame_size: usize) -> Self {
        Self {
            io,
            buffer: FrameBuffer::with_max_frame_size(max_frame_size),
            pending: VecDeque::new(),
            read_buf: vec![0u8; 64 * 1024],
        }
    }

    /// Read the next frame; `Ok(None)` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.io.read(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend(self.buffer.push(&self.read_buf[..n])?);
        }
    }
}

/// Write side: encodes frames with their length prefix.
pub struct FramedWriter {
    io: WriteHalf<BoxIo>,
}

impl FramedWriter {
    pub(crate) fn new(io: WriteHalf<BoxIo>) -> Self {
        Self { io }
    }

    /// Queue one frame on the stream without flushing.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.io.write_all(&encode_prefixed(frame)).await?;
        Ok(())
    }

    /// Flush buffered bytes to the peer.
    pub async fn flush(&mut self) -> Result<()> {
        self.io.flush().await?;
        Ok(())
    }

    /// Shut the write side down.
    pub async fn close(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
