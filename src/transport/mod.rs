//! Transport adapters: dialing, listening and the framed connection halves.
//!
//! The rest of the crate is transport-agnostic: a [`Connection`] splits into
//! a [`ConnectionReader`] yielding decoded frames and a [`ConnectionWriter`]
//! consuming them. The TCP/Unix binding adds a 24-bit length prefix per
//! frame ([`framed`]); the WebSocket binding maps one frame to one binary
//! message ([`ws`]).

mod framed;
mod uri;
mod ws;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use futures_util::StreamExt;

pub use framed::{FramedReader, FramedWriter};
pub use uri::TransportUri;
pub use ws::{WsReader, WsWriter};

use crate::error::{RSocketError, Result};
use crate::frame::{Frame, DEFAULT_MAX_FRAME_SIZE};

/// Byte stream a framed connection can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Boxed byte stream.
pub type BoxIo = Box<dyn IoStream>;

/// An established frame-level connection, either binding.
pub enum Connection {
    /// Length-prefixed frames over an ordered byte stream.
    Framed(BoxIo),
    /// One frame per websocket binary message.
    WebSocket(tokio_tungstenite::WebSocketStream<BoxIo>),
}

impl Connection {
    /// Wrap an arbitrary byte stream (TCP, Unix socket, in-memory duplex)
    /// in the length-prefixed binding.
    pub fn from_io<T: IoStream + 'static>(io: T) -> Self {
        Connection::Framed(Box::new(io))
    }

    /// Split into independently owned read and write halves.
    pub fn split(self, max_frame_size: usize) -> (ConnectionReader, ConnectionWriter) {
        match self {
            Connection::Framed(io) => {
                let (r, w) = tokio::io::split(io);
                (
                    ConnectionReader::Framed(FramedReader::new(r, max_frame_size)),
                    ConnectionWriter::Framed(FramedWriter::new(w)),
                )
            }
            Connection::WebSocket(ws) => {
                let (w, r) = ws.split();
                (
                    ConnectionReader::Ws(WsReader::new(r)),
                    ConnectionWriter::Ws(WsWriter::new(w)),
                )
            }
        }
    }
}

/// Read half of a connection.
pub enum ConnectionReader {
    /// Length-prefixed byte stream.
    Framed(FramedReader),
    /// WebSocket messages.
    Ws(WsReader),
}

impl ConnectionReader {
    /// Read the next frame; `Ok(None)` on orderly EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            ConnectionReader::Framed(r) => r.read_frame().await,
            ConnectionReader::Ws(r) => r.read_frame().await,
        }
    }
}

/// Write half of a connection.
pub enum ConnectionWriter {
    /// Length-prefixed byte stream.
    Framed(FramedWriter),
    /// WebSocket messages.
    Ws(WsWriter),
}

impl ConnectionWriter {
    /// Queue a frame without flushing.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match self {
            ConnectionWriter::Framed(w) => w.write_frame(frame).await,
            ConnectionWriter::Ws(w) => w.write_frame(frame).await,
        }
    }

    /// Flush queued frames to the peer.
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            ConnectionWriter::Framed(w) => w.flush().await,
            ConnectionWriter::Ws(w) => w.flush().await,
        }
    }

    /// Shut the write side down.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            ConnectionWriter::Framed(w) => w.close().await,
            ConnectionWriter::Ws(w) => w.close().await,
        }
    }
}

/// Dial a client connection for a parsed URI.
pub async fn connect(uri: &TransportUri) -> Result<Connection> {
    match uri {
        TransportUri::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(Connection::from_io(stream))
        }
        TransportUri::Ws { url, addr } => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let io: BoxIo = Box::new(stream);
            let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), io).await?;
            Ok(Connection::WebSocket(ws))
        }
        #[cfg(unix)]
        TransportUri::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Connection::from_io(stream))
        }
        #[cfg(not(unix))]
        TransportUri::Unix(_) => Err(RSocketError::Unsupported(
            "unix sockets are not available on this platform".to_string(),
        )),
        TransportUri::Tls(_) | TransportUri::Wss { .. } => Err(RSocketError::Unsupported(format!(
            "TLS transport is configured outside this crate: {}",
            uri
        ))),
    }
}

/// A bound server listener for one of the supported bindings.
pub enum Listener {
    /// Plain TCP, length-prefixed frames.
    Tcp(TcpListener),
    /// TCP accepting websocket upgrades.
    Ws(TcpListener),
    /// Unix domain socket.
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listener for a parsed URI.
    pub async fn bind(uri: &TransportUri) -> Result<Self> {
        match uri {
            TransportUri::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            TransportUri::Ws { addr, .. } => Ok(Listener::Ws(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            TransportUri::Unix(path) => {
                if std::path::Path::new(path).exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            #[cfg(not(unix))]
            TransportUri::Unix(_) => Err(RSocketError::Unsupported(
                "unix sockets are not available on this platform".to_string(),
            )),
            TransportUri::Tls(_) | TransportUri::Wss { .. } => {
                Err(RSocketError::Unsupported(format!(
                    "TLS transport is configured outside this crate: {}",
                    uri
                )))
            }
        }
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Connection::from_io(stream))
            }
            Listener::Ws(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let io: BoxIo = Box::new(stream);
                let ws = tokio_tungstenite::accept_async(io).await?;
                Ok(Connection::WebSocket(ws))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Connection::from_io(stream))
            }
        }
    }

    /// Local address, for logging.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Listener::Tcp(l) | Listener::Ws(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }
}

/// Default maximum frame size for [`Connection::split`] callers.
pub const MAX_FRAME_SIZE: usize = DEFAULT_MAX_FRAME_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    #[tokio::test]
    async fn test_duplex_connection_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut reader, _wa) = Connection::from_io(a).split(MAX_FRAME_SIZE);
        let (_rb, mut writer) = Connection::from_io(b).split(MAX_FRAME_SIZE);

        let frame = Frame::payload_next(1, Payload::from("over duplex"));
        writer.write_frame(&frame).await.unwrap();
        writer.flush().await.unwrap();

        let got = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_tcp_listener_accept_and_connect() {
        let uri = TransportUri::parse("tcp://127.0.0.1:0").unwrap();
        let listener = Listener::bind(&uri).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dial = TransportUri::parse(&format!("tcp://{}", addr)).unwrap();
        let (client, server) = tokio::join!(connect(&dial), listener.accept());
        let (_cr, mut cw) = client.unwrap().split(MAX_FRAME_SIZE);
        let (mut sr, _sw) = server.unwrap().split(MAX_FRAME_SIZE);

        let frame = Frame::cancel(9);
        cw.write_frame(&frame).await.unwrap();
        cw.flush().await.unwrap();
        assert_eq!(sr.read_frame().await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_tls_rejected_at_dial() {
        let uri = TransportUri::parse("tcps://localhost:7878").unwrap();
        assert!(matches!(
            connect(&uri).await,
            Err(RSocketError::Unsupported(_))
        ));
    }
}
