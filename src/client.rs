//! Client builder and connection lifecycle.
//!
//! The [`ClientBuilder`] configures the SETUP handshake and connection
//! tunables, dials the transport, and starts the per-connection tasks:
//! 1. Dial (or adopt) a connection
//! 2. Spawn the writer task
//! 3. Send SETUP
//! 4. Spawn the dispatcher and the keepalive driver
//!
//! # Example
//!
//! ```ignore
//! use rsocket_core::{Client, Payload};
//!
//! #[tokio::main]
//! async fn main() -> rsocket_core::Result<()> {
//!     let client = Client::builder()
//!         .transport("tcp://127.0.0.1:7878")
//!         .keepalive(std::time::Duration::from_secs(20))
//!         .connect()
//!         .await?;
//!
//!     let response = client
//!         .request_response(Payload::builder().set_data_utf8("ping").build())
//!         .await?;
//!     println!("{:?}", response.data_utf8());
//!     Ok(())
//! }
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{RSocketError, Result};
use crate::frame::{Frame, FrameBody, VERSION};
use crate::payload::Payload;
use crate::responder::Responder;
use crate::socket::dispatcher;
use crate::socket::duplex::{
    CloseHandler, DuplexSocket, SocketConfig, SocketRole, SocketShared, DEFAULT_MIME_TYPE,
};
use crate::socket::keepalive::spawn_keepalive;
use crate::socket::resume::{Positions, ReplayBuffer};
use crate::socket::writer::{spawn_writer, FrameSender};
use crate::transport::{self, Connection, TransportUri};

/// Builder for configuring and connecting a client.
pub struct ClientBuilder {
    uri: Option<String>,
    connection: Option<Connection>,
    config: SocketConfig,
    setup_payload: Payload,
    metadata_mime: String,
    data_mime: String,
    lease: bool,
    resume_token: Option<Bytes>,
    responder: Responder,
    on_close: Option<CloseHandler>,
}

impl ClientBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            uri: None,
            connection: None,
            config: SocketConfig::default(),
            setup_payload: Payload::empty(),
            metadata_mime: DEFAULT_MIME_TYPE.to_string(),
            data_mime: DEFAULT_MIME_TYPE.to_string(),
            lease: false,
            resume_token: None,
            responder: Responder::empty(),
            on_close: None,
        }
    }

    /// Dial this URI at connect time (`tcp://`, `ws://`, `unix://`, ...).
    pub fn transport(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    /// Adopt an already-established connection instead of dialing.
    pub fn connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Keepalive tick interval sent in SETUP.
    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Max lifetime without inbound frames sent in SETUP.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lifetime = lifetime;
        self
    }

    /// Fragment outbound payloads larger than `mtu` bytes.
    pub fn fragment_mtu(mut self, mtu: usize) -> Self {
        self.config.fragment_mtu = Some(mtu);
        self
    }

    /// SETUP payload handed to the server acceptor.
    pub fn setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = payload;
        self
    }

    /// MIME type for payload metadata.
    pub fn metadata_mime_type(mut self, mime: &str) -> Self {
        self.metadata_mime = mime.to_string();
        self
    }

    /// MIME type for payload data.
    pub fn data_mime_type(mut self, mime: &str) -> Self {
        self.data_mime = mime.to_string();
        self
    }

    /// Honor LEASE frames: no request leaves without a live lease.
    pub fn lease(mut self) -> Self {
        self.lease = true;
        self
    }

    /// Enable session resumption with this token.
    pub fn resume_token(mut self, token: impl Into<Bytes>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    /// Responder for server-initiated requests on this connection.
    pub fn responder(mut self, responder: Responder) -> Self {
        self.responder = responder;
        self
    }

    /// Hook invoked exactly once when the connection dies.
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Option<&RSocketError>) + Send + 'static,
    {
        self.on_close = Some(Box::new(handler));
        self
    }

    /// Override the full configuration.
    pub fn config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Dial, perform the SETUP handshake, and start the connection tasks.
    pub async fn connect(self) -> Result<Client> {
        let connection = match (self.connection, &self.uri) {
            (Some(connection), _) => connection,
            (None, Some(uri)) => transport::connect(&TransportUri::parse(uri)?).await?,
            (None, None) => {
                return Err(RSocketError::Unsupported(
                    "no transport configured: call transport() or connection()".to_string(),
                ))
            }
        };

        let config = self.config;
        let (reader, writer_half) = connection.split(config.max_frame_size);

        let positions = Arc::new(Positions::new());
        let replay = self
            .resume_token
            .is_some()
            .then(|| Arc::new(ReplayBuffer::new(config.replay_budget)));
        let (tx, writer_task) = spawn_writer(
            writer_half,
            config.writer_queue_capacity,
            positions.clone(),
            replay.clone(),
        );
        let sender = FrameSender::new(tx);

        let shared = SocketShared::new(
            SocketRole::Client,
            config,
            sender,
            positions,
            replay,
            self.responder,
            None,
            self.lease,
            self.on_close,
        );

        let setup = Frame {
            stream_id: 0,
            body: FrameBody::Setup {
                version: VERSION,
                keepalive_millis: shared.config.keepalive_interval.as_millis() as u32,
                max_lifetime_millis: shared.config.max_lifetime.as_millis() as u32,
                lease: self.lease,
                resume_token: self.resume_token.clone(),
                metadata_mime: self.metadata_mime,
                data_mime: self.data_mime,
                payload: self.setup_payload,
            },
        };
        shared.sender.send(setup).await?;

        tokio::spawn(dispatcher::run(shared.clone(), reader));
        spawn_keepalive(
            shared.sender.clone(),
            shared.positions.clone(),
            shared.keepalive_interval(),
            shared.subscribe_close(),
        );
        shared
            .keepalive_started
            .store(true, std::sync::atomic::Ordering::Release);

        // Transport write failures surface through the writer task.
        {
            let shared = shared.clone();
            tokio::spawn(async move {
                if let Ok(Err(e)) = writer_task.await {
                    if !shared.resume_enabled() {
                        shared.close(Some(e));
                    } else {
                        tracing::info!("Writer transport lost; session parked: {}", e);
                    }
                }
            });
        }

        Ok(Client {
            socket: DuplexSocket::new(shared),
            resume_token: self.resume_token,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected client peer.
///
/// Derefs to [`DuplexSocket`], so the interaction methods are called
/// directly on the client.
pub struct Client {
    socket: DuplexSocket,
    resume_token: Option<Bytes>,
}

impl Client {
    /// Create a client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The duplex socket handle (cheap to clone and hand out).
    pub fn socket(&self) -> DuplexSocket {
        self.socket.clone()
    }

    /// Reattach this logical session to a fresh transport.
    ///
    /// Sends RESUME as the first frame, and on RESUME_OK retransmits from
    /// the server's acknowledged position before resuming normal operation.
    /// Fails with the server's error when the resume attempt is rejected.
    pub async fn resume_with(&self, connection: Connection) -> Result<()> {
        let shared = &self.socket.shared;
        let token = self
            .resume_token
            .clone()
            .ok_or_else(|| RSocketError::Unsupported("resume token not configured".to_string()))?;
        let replay = shared
            .replay
            .clone()
            .ok_or_else(|| RSocketError::Unsupported("resume not enabled".to_string()))?;
        if shared.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }

        let (mut reader, mut writer) = connection.split(shared.config.max_frame_size);

        // The handshake happens below the writer task: RESUME and the
        // retransmitted frames must not re-enter the position counters.
        let resume = Frame {
            stream_id: 0,
            body: FrameBody::Resume {
                token,
                last_received_server_position: shared.positions.received(),
                first_available_client_position: replay.first_available(),
            },
        };
        writer.write_frame(&resume).await?;
        writer.flush().await?;

        match reader.read_frame().await? {
            Some(Frame {
                body:
                    FrameBody::ResumeOk {
                        last_received_client_position,
                    },
                ..
            }) => {
                let frames = replay
                    .frames_from(last_received_client_position)
                    .ok_or_else(|| {
                        RSocketError::Protocol(format!(
                            "peer position {} is outside the replay buffer",
                            last_received_client_position
                        ))
                    })?;
                tracing::debug!(
                    retransmit = frames.len(),
                    from = last_received_client_position,
                    "Session resumed"
                );
                for frame in &frames {
                    writer.write_frame(frame).await?;
                }
                writer.flush().await?;
            }
            Some(Frame {
                body: FrameBody::Error { code, data },
                ..
            }) => return Err(RSocketError::remote(code, &data)),
            other => {
                return Err(RSocketError::Protocol(format!(
                    "unexpected frame during resume handshake: {:?}",
                    other.map(|f| f.frame_type())
                )))
            }
        }

        let (tx, writer_task) = spawn_writer(
            writer,
            shared.config.writer_queue_capacity,
            shared.positions.clone(),
            Some(replay),
        );
        shared.sender.swap(tx);
        tokio::spawn(dispatcher::run(shared.clone(), reader));
        tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                tracing::info!("Writer transport lost; session parked: {}", e);
            }
        });
        Ok(())
    }

    /// Close the connection and wait for teardown.
    pub async fn shutdown(self) {
        self.socket.close();
        self.socket.closed().await;
    }
}

impl Deref for Client {
    type Target = DuplexSocket;

    fn deref(&self) -> &Self::Target {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ClientBuilder::new();
        assert!(builder.uri.is_none());
        assert!(!builder.lease);
        assert!(builder.resume_token.is_none());
        assert_eq!(builder.metadata_mime, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_connect_without_transport_fails() {
        let result = ClientBuilder::new().connect().await;
        assert!(matches!(result, Err(RSocketError::Unsupported(_))));
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = Client::builder()
            .transport("tcp://127.0.0.1:7878")
            .keepalive(Duration::from_millis(500))
            .max_lifetime(Duration::from_millis(1500))
            .fragment_mtu(4096)
            .lease()
            .resume_token(Bytes::from_static(b"tok"))
            .data_mime_type("application/json");
        assert_eq!(builder.config.keepalive_interval, Duration::from_millis(500));
        assert_eq!(builder.config.fragment_mtu, Some(4096));
        assert!(builder.lease);
        assert_eq!(builder.data_mime, "application/json");
    }
}
