//! WebSocket frame transport: one protocol frame per binary message.
//!
//! No length prefix here; message boundaries come from the websocket layer.
//! Text messages are not part of the binding and are dropped with a warning;
//! ping/pong are handled by tungstenite underneath.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::BoxIo;
use crate::error::Result;
use crate::frame::{self, Frame};

type WsRead = futures_util::stream::SplitStream<WebSocketStream<BoxIo>>;
type WsWrite = futures_util::stream::SplitSink<WebSocketStream<BoxIo>, Message>;

/// Read side of a websocket connection.
pub struct WsReader {
    io: WsRead,
}

impl WsReader {
    pub(crate) fn new(io: WsRead) -> Self {
        Self { io }
    }

    /// Read the next frame; `Ok(None)` on close or EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.io.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(decoded) = frame::decode(Bytes::from(data))? {
                        return Ok(Some(decoded));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Text(_))) => {
                    tracing::warn!("Dropping unexpected text message on websocket transport");
                }
                Some(Ok(_)) => {} // ping/pong/raw, nothing to deliver
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Write side of a websocket connection.
pub struct WsWriter {
    io: WsWrite,
}

impl WsWriter {
    pub(crate) fn new(io: WsWrite) -> Self {
        Self { io }
    }

    /// Queue one frame as a binary message without flushing.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.io.feed(Message::Binary(frame.encode().to_vec())).await?;
        Ok(())
    }

    /// Flush queued messages.
    pub async fn flush(&mut self) -> Result<()> {
        self.io.flush().await?;
        Ok(())
    }

    /// Send a close message and shut the sink down.
    pub async fn close(&mut self) -> Result<()> {
        self.io.close().await?;
        Ok(())
    }
}
