//! Server builder: bind a listener, accept connections, run acceptors.
//!
//! # Example
//!
//! ```ignore
//! use rsocket_core::{Payload, Responder, ServerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> rsocket_core::Result<()> {
//!     ServerBuilder::new()
//!         .transport("tcp://127.0.0.1:7878")
//!         .acceptor(|setup, _peer| {
//!             tracing::info!("connection established: {:?}", setup.data_mime);
//!             Ok(Responder::builder()
//!                 .request_response(|payload| async move { Ok(payload) })
//!                 .build())
//!         })
//!         .serve()
//!         .await
//! }
//! ```

use std::sync::Arc;

use crate::error::{RSocketError, Result};
use crate::responder::Responder;
use crate::socket::dispatcher;
use crate::socket::duplex::{
    Acceptor, DuplexSocket, SetupInfo, SocketConfig, SocketRole, SocketShared,
};
use crate::socket::resume::Positions;
use crate::socket::writer::{spawn_writer, FrameSender};
use crate::transport::{Connection, Listener, TransportUri};

/// Builder for an accepting peer.
pub struct ServerBuilder {
    uri: Option<String>,
    config: SocketConfig,
    acceptor: Option<Acceptor>,
    on_start: Option<Box<dyn FnOnce() + Send>>,
}

impl ServerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            uri: None,
            config: SocketConfig::default(),
            acceptor: None,
            on_start: None,
        }
    }

    /// Bind this URI at serve time (`tcp://`, `ws://`, `unix://`).
    pub fn transport(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    /// Fragment outbound payloads larger than `mtu` bytes.
    pub fn fragment_mtu(mut self, mtu: usize) -> Self {
        self.config.fragment_mtu = Some(mtu);
        self
    }

    /// Override the full configuration.
    pub fn config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-connection hook: receives the SETUP parameters and this side's
    /// requester handle, returns the responder for the connection.
    pub fn acceptor<F>(mut self, acceptor: F) -> Self
    where
        F: Fn(SetupInfo, DuplexSocket) -> Result<Responder> + Send + Sync + 'static,
    {
        self.acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Hook invoked once the listener is bound.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Bind and accept connections until the listener fails.
    pub async fn serve(mut self) -> Result<()> {
        let uri = self.uri.take().ok_or_else(|| {
            RSocketError::Unsupported("no transport configured: call transport()".to_string())
        })?;
        let listener = Listener::bind(&TransportUri::parse(&uri)?).await?;
        if let Some(addr) = listener.local_addr() {
            tracing::info!(%addr, "Listening");
        }
        if let Some(hook) = self.on_start.take() {
            hook();
        }

        loop {
            match listener.accept().await {
                Ok(connection) => {
                    if let Err(e) = self.accept(connection) {
                        tracing::error!("Connection setup failed: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Adopt one established connection as the accepting side.
    ///
    /// Spawns the connection tasks and returns this side's requester
    /// handle; the responder is installed once SETUP arrives. Useful for
    /// tests and for embedding the server on custom transports.
    pub fn accept(&self, connection: Connection) -> Result<DuplexSocket> {
        let config = self.config.clone();
        let (reader, writer_half) = connection.split(config.max_frame_size);

        let positions = Arc::new(Positions::new());
        let (tx, _writer_task) = spawn_writer(
            writer_half,
            config.writer_queue_capacity,
            positions.clone(),
            None,
        );
        let shared = SocketShared::new(
            SocketRole::Server,
            config,
            FrameSender::new(tx),
            positions,
            None,
            Responder::empty(),
            self.acceptor.clone(),
            false,
            None,
        );
        tokio::spawn(dispatcher::run(shared.clone(), reader));
        Ok(DuplexSocket::new(shared))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
