//! # rsocket-core
//!
//! A symmetric [RSocket](https://rsocket.io) 1.0 peer for tokio: a
//! bidirectional, multiplexed application protocol over TCP, Unix sockets
//! or WebSocket.
//!
//! One connection carries any number of independent streams in four
//! interaction models — fire-and-forget, request/response, request/stream
//! and request/channel — with request-n backpressure, cancellation,
//! keepalive liveness, optional lease admission and optional session
//! resumption.
//!
//! ## Architecture
//!
//! - **Frame layer** ([`frame`]): pure codec between typed [`frame::Frame`]
//!   values and wire bytes, plus FOLLOWS-chain fragmentation.
//! - **Transports** ([`transport`]): length-prefixed TCP/Unix and
//!   message-framed WebSocket adapters behind one connection interface.
//! - **Connection core** ([`socket`]): a reader task (dispatcher), a writer
//!   task fed by a bounded queue, a keepalive driver, and per-stream state.
//! - **Reactive surface** ([`reactive`]): the narrow producer/consumer
//!   contract handed to application code.
//!
//! ## Example
//!
//! ```ignore
//! use rsocket_core::{Client, Payload, Responder, ServerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> rsocket_core::Result<()> {
//!     tokio::spawn(
//!         ServerBuilder::new()
//!             .transport("tcp://127.0.0.1:7878")
//!             .acceptor(|_setup, _peer| {
//!                 Ok(Responder::builder()
//!                     .request_response(|payload| async move { Ok(payload) })
//!                     .build())
//!             })
//!             .serve(),
//!     );
//!
//!     let client = Client::builder()
//!         .transport("tcp://127.0.0.1:7878")
//!         .connect()
//!         .await?;
//!     let echo = client
//!         .request_response(Payload::builder().set_data_utf8("ping").build())
//!         .await?;
//!     assert_eq!(echo.data_utf8(), Some("ping"));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod frame;
pub mod payload;
pub mod reactive;
pub mod responder;
pub mod socket;
pub mod transport;

mod client;
mod server;

pub use client::{Client, ClientBuilder};
pub use error::{ErrorCode, RSocketError, Result};
pub use payload::{Payload, PayloadBuilder};
pub use reactive::{CreditWindow, PayloadStream, ProducerSink};
pub use responder::{Responder, ResponderBuilder};
pub use server::ServerBuilder;
pub use socket::duplex::{DuplexSocket, SetupInfo, SocketConfig};
