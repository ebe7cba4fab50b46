//! The duplex socket: connection-shared state plus the user-facing
//! interaction methods.
//!
//! One [`SocketShared`] exists per logical connection, jointly referenced by
//! the dispatcher task, the writer task, the keepalive driver and every
//! outstanding request. [`DuplexSocket`] is the cheap clonable handle
//! application code holds; both peers get one, because either side can
//! request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use super::lease::LeaseState;
use super::registry::{StreamIds, StreamKind, StreamRegistry, StreamRole, StreamSignal, StreamSlot};
use super::resume::{Positions, ReplayBuffer, DEFAULT_REPLAY_BUDGET};
use super::writer::{FrameSender, DEFAULT_QUEUE_CAPACITY};
use crate::error::{ErrorCode, RSocketError, Result};
use crate::frame::{
    Frame, FrameBody, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_REASSEMBLY_SIZE, MAX_REQUEST_N,
};
use crate::payload::Payload;
use crate::reactive::{CreditWindow, PayloadStream, ProducerSink};
use crate::responder::Responder;

/// Default keepalive tick interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default max lifetime without a received frame.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// Default MIME type for payload data and metadata.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Which end of the connection this socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Dialing side; sends SETUP, allocates odd stream ids.
    Client,
    /// Accepting side; receives SETUP, allocates even stream ids.
    Server,
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Keepalive tick interval.
    pub keepalive_interval: Duration,
    /// Receive deadline: max time without any inbound frame.
    pub max_lifetime: Duration,
    /// Fragment payloads larger than this many bytes; `None` disables
    /// outbound fragmentation.
    pub fragment_mtu: Option<usize>,
    /// Largest frame accepted from the wire.
    pub max_frame_size: usize,
    /// Bound on one stream's buffered FOLLOWS chain.
    pub max_reassembly_size: usize,
    /// Outbound writer queue capacity, in frames.
    pub writer_queue_capacity: usize,
    /// Initial credit `request_stream` asks for.
    pub stream_initial_credit: u32,
    /// Initial credit `request_channel` grants in each direction.
    pub channel_initial_credit: u32,
    /// Replay buffer budget when resume is enabled.
    pub replay_budget: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            fragment_mtu: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_reassembly_size: DEFAULT_MAX_REASSEMBLY_SIZE,
            writer_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_initial_credit: MAX_REQUEST_N,
            channel_initial_credit: MAX_REQUEST_N,
            replay_budget: DEFAULT_REPLAY_BUDGET,
        }
    }
}

/// Connection parameters carried by SETUP, handed to the server acceptor.
#[derive(Debug, Clone)]
pub struct SetupInfo {
    /// Client's keepalive interval.
    pub keepalive_interval: Duration,
    /// Client's max lifetime.
    pub max_lifetime: Duration,
    /// The client honors LEASE frames.
    pub lease: bool,
    /// Resume token, when the client enabled resumption.
    pub resume_token: Option<Bytes>,
    /// MIME type for payload metadata.
    pub metadata_mime: String,
    /// MIME type for payload data.
    pub data_mime: String,
    /// Setup payload.
    pub payload: Payload,
}

/// Server-side hook invoked with the SETUP parameters and the server's own
/// requester handle; returns the responder for this connection.
pub type Acceptor = Arc<dyn Fn(SetupInfo, DuplexSocket) -> Result<Responder> + Send + Sync>;

/// Hook invoked exactly once when the connection dies.
pub type CloseHandler = Box<dyn FnOnce(Option<&RSocketError>) + Send>;

/// State shared by every task and handle of one connection.
pub(crate) struct SocketShared {
    pub(crate) role: SocketRole,
    pub(crate) config: SocketConfig,
    pub(crate) sender: FrameSender,
    pub(crate) registry: Arc<StreamRegistry>,
    pub(crate) ids: StreamIds,
    pub(crate) positions: Arc<Positions>,
    pub(crate) replay: Option<Arc<ReplayBuffer>>,
    pub(crate) responder: Mutex<Arc<Responder>>,
    pub(crate) acceptor: Option<Acceptor>,
    pub(crate) lease_enabled: AtomicBool,
    pub(crate) issued_lease: LeaseState,
    pub(crate) received_lease: LeaseState,
    keepalive_millis: AtomicU64,
    max_lifetime_millis: AtomicU64,
    pub(crate) keepalive_started: AtomicBool,
    pub(crate) setup_received: AtomicBool,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    on_close: Mutex<Option<CloseHandler>>,
}

impl SocketShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: SocketRole,
        config: SocketConfig,
        sender: FrameSender,
        positions: Arc<Positions>,
        replay: Option<Arc<ReplayBuffer>>,
        responder: Responder,
        acceptor: Option<Acceptor>,
        lease: bool,
        on_close: Option<CloseHandler>,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        let keepalive_millis = config.keepalive_interval.as_millis() as u64;
        let max_lifetime_millis = config.max_lifetime.as_millis() as u64;
        Arc::new(Self {
            role,
            ids: match role {
                SocketRole::Client => StreamIds::client(),
                SocketRole::Server => StreamIds::server(),
            },
            config,
            sender,
            registry: Arc::new(StreamRegistry::new()),
            positions,
            replay,
            responder: Mutex::new(Arc::new(responder)),
            acceptor,
            lease_enabled: AtomicBool::new(lease),
            issued_lease: LeaseState::new(),
            received_lease: LeaseState::new(),
            keepalive_millis: AtomicU64::new(keepalive_millis),
            max_lifetime_millis: AtomicU64::new(max_lifetime_millis),
            keepalive_started: AtomicBool::new(false),
            setup_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_tx,
            on_close: Mutex::new(on_close),
        })
    }

    /// Negotiated keepalive interval.
    pub(crate) fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_millis.load(Ordering::Acquire))
    }

    /// Negotiated max lifetime.
    pub(crate) fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_millis.load(Ordering::Acquire))
    }

    /// Install the SETUP-negotiated timings (server side).
    pub(crate) fn install_timings(&self, keepalive: Duration, max_lifetime: Duration) {
        self.keepalive_millis
            .store(keepalive.as_millis() as u64, Ordering::Release);
        self.max_lifetime_millis
            .store(max_lifetime.as_millis() as u64, Ordering::Release);
    }

    /// Whether leasing is active on this connection.
    pub(crate) fn leasing(&self) -> bool {
        self.lease_enabled.load(Ordering::Acquire)
    }

    /// Whether the session keeps state across transports.
    pub(crate) fn resume_enabled(&self) -> bool {
        self.replay.is_some()
    }

    /// Subscribe to the close signal.
    pub(crate) fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Whether the connection is closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Terminate the connection exactly once.
    ///
    /// Every live stream observes a terminal error, every task observes the
    /// close signal, and the close handler runs once.
    pub(crate) fn close(&self, reason: Option<RSocketError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &reason {
            Some(e) => tracing::warn!("Connection closed: {}", e),
            None => tracing::debug!("Connection closed"),
        }
        let _ = self.close_tx.send(true);

        let message = reason
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "connection closed".to_string());
        for slot in self.registry.drain() {
            slot.deliver(StreamSignal::Error(RSocketError::Remote {
                code: ErrorCode::ConnectionError,
                message: message.clone(),
            }));
            slot.cancel();
        }

        if let Some(handler) = self.on_close.lock().expect("close lock").take() {
            handler(reason.as_ref());
        }
    }

    /// Admission gate for outgoing requests under lease.
    fn admit_outgoing(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        if self.leasing() && !self.received_lease.try_use() {
            return Err(RSocketError::RejectedByLease);
        }
        Ok(())
    }
}

/// User-facing handle for one connection: the four interaction models plus
/// metadata push and lease granting. Cheap to clone.
#[derive(Clone)]
pub struct DuplexSocket {
    pub(crate) shared: Arc<SocketShared>,
}

impl DuplexSocket {
    pub(crate) fn new(shared: Arc<SocketShared>) -> Self {
        Self { shared }
    }

    /// Send a request expecting no response.
    ///
    /// Resolves once the frame is handed to the writer task, which writes
    /// and flushes eagerly.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.shared.admit_outgoing()?;
        let id = self.shared.ids.next()?;
        let frame = Frame {
            stream_id: id,
            body: FrameBody::RequestFnf {
                follows: false,
                payload,
            },
        };
        self.shared
            .sender
            .send_with_mtu(frame, self.shared.config.fragment_mtu)
            .await
    }

    /// Send a request expecting exactly one response payload.
    ///
    /// Dropping the returned future before it resolves cancels the request
    /// on the wire.
    pub async fn request_response(&self, payload: Payload) -> Result<Payload> {
        self.shared.admit_outgoing()?;
        let id = self.shared.ids.next()?;
        let (slot, mut rx) = StreamSlot::new(
            id,
            StreamKind::RequestResponse,
            StreamRole::Requester,
            Arc::new(CreditWindow::new(0)),
        );
        self.shared.registry.register(slot.clone());

        let mut guard = CancelGuard {
            slot: slot.clone(),
            registry: self.shared.registry.clone(),
            sender: self.shared.sender.clone(),
            armed: true,
        };

        let frame = Frame {
            stream_id: id,
            body: FrameBody::RequestResponse {
                follows: false,
                payload,
            },
        };
        self.shared
            .sender
            .send_with_mtu(frame, self.shared.config.fragment_mtu)
            .await?;

        let mut value: Option<Payload> = None;
        let outcome = loop {
            match rx.recv().await {
                Some(StreamSignal::Next(payload)) => value = Some(payload),
                Some(StreamSignal::Complete) => break Ok(value.take().unwrap_or_default()),
                Some(StreamSignal::Error(e)) => break Err(e),
                None => break Err(RSocketError::ConnectionClosed),
            }
        };
        guard.armed = false;
        outcome
    }

    /// Request a stream of payloads with the configured initial credit.
    pub async fn request_stream(&self, payload: Payload) -> Result<PayloadStream> {
        self.request_stream_n(payload, self.shared.config.stream_initial_credit)
            .await
    }

    /// Request a stream of payloads, granting `initial_n` frames of credit.
    pub async fn request_stream_n(
        &self,
        payload: Payload,
        initial_n: u32,
    ) -> Result<PayloadStream> {
        if initial_n == 0 {
            return Err(RSocketError::Protocol(
                "initial request n must be positive".to_string(),
            ));
        }
        self.shared.admit_outgoing()?;
        let id = self.shared.ids.next()?;
        let (slot, rx) = StreamSlot::new(
            id,
            StreamKind::RequestStream,
            StreamRole::Requester,
            Arc::new(CreditWindow::new(0)),
        );
        self.shared.registry.register(slot.clone());

        let frame = Frame {
            stream_id: id,
            body: FrameBody::RequestStream {
                follows: false,
                initial_request_n: initial_n,
                payload,
            },
        };
        if let Err(e) = self
            .shared
            .sender
            .send_with_mtu(frame, self.shared.config.fragment_mtu)
            .await
        {
            self.shared.registry.remove(id);
            return Err(e);
        }

        Ok(PayloadStream::new(
            slot,
            self.shared.registry.clone(),
            self.shared.sender.clone(),
            rx,
        ))
    }

    /// Open a bidirectional channel, sending `first` as its first payload.
    ///
    /// Returns the sink for this side's further payloads and the stream of
    /// the peer's payloads. Completing the sink half-closes the channel;
    /// the channel terminates when both halves complete.
    pub async fn request_channel(
        &self,
        first: Payload,
    ) -> Result<(ProducerSink, PayloadStream)> {
        self.request_channel_n(first, self.shared.config.channel_initial_credit)
            .await
    }

    /// Open a channel granting the responder `initial_n` frames of credit.
    pub async fn request_channel_n(
        &self,
        first: Payload,
        initial_n: u32,
    ) -> Result<(ProducerSink, PayloadStream)> {
        if initial_n == 0 {
            return Err(RSocketError::Protocol(
                "initial request n must be positive".to_string(),
            ));
        }
        self.shared.admit_outgoing()?;
        let id = self.shared.ids.next()?;
        // Our outbound credit arrives via the responder's REQUEST_N.
        let (slot, rx) = StreamSlot::new(
            id,
            StreamKind::RequestChannel,
            StreamRole::Requester,
            Arc::new(CreditWindow::new(0)),
        );
        self.shared.registry.register(slot.clone());

        let frame = Frame {
            stream_id: id,
            body: FrameBody::RequestChannel {
                follows: false,
                complete: false,
                initial_request_n: initial_n,
                payload: first,
            },
        };
        if let Err(e) = self
            .shared
            .sender
            .send_with_mtu(frame, self.shared.config.fragment_mtu)
            .await
        {
            self.shared.registry.remove(id);
            return Err(e);
        }

        let sink = ProducerSink::new(
            slot.clone(),
            self.shared.registry.clone(),
            self.shared.sender.clone(),
            self.shared.config.fragment_mtu,
        );
        let stream = PayloadStream::new(
            slot,
            self.shared.registry.clone(),
            self.shared.sender.clone(),
            rx,
        );
        Ok((sink, stream))
    }

    /// Push connection-level metadata, fire-and-forget.
    pub async fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        if self.shared.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        self.shared.sender.send(Frame::metadata_push(metadata)).await
    }

    /// Grant the peer a lease of `number_of_requests` requests for `ttl`.
    pub async fn send_lease(
        &self,
        ttl: Duration,
        number_of_requests: u32,
        metadata: Option<Bytes>,
    ) -> Result<()> {
        if self.shared.is_closed() {
            return Err(RSocketError::ConnectionClosed);
        }
        self.shared.issued_lease.arm(ttl, number_of_requests);
        self.shared
            .sender
            .send(Frame {
                stream_id: 0,
                body: FrameBody::Lease {
                    ttl_millis: ttl.as_millis() as u32,
                    number_of_requests,
                    metadata,
                },
            })
            .await
    }

    /// Close the connection gracefully.
    pub fn close(&self) {
        self.shared.close(None);
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the connection closes.
    pub async fn closed(&self) {
        let mut rx = self.shared.subscribe_close();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Number of live streams (diagnostics).
    pub fn live_streams(&self) -> usize {
        self.shared.registry.len()
    }

    /// Bytes of frames received so far on this connection.
    pub fn position_received(&self) -> u64 {
        self.shared.positions.received()
    }
}

/// Cancels a request/response when its future is dropped mid-flight.
struct CancelGuard {
    slot: Arc<StreamSlot>,
    registry: Arc<StreamRegistry>,
    sender: FrameSender,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed || self.slot.is_terminated() {
            return;
        }
        self.slot.cancel();
        self.registry.remove(self.slot.id);
        if self.sender.try_send(Frame::cancel(self.slot.id)).is_err() {
            tracing::debug!(
                stream_id = self.slot.id,
                "CANCEL for dropped request not queued"
            );
        }
    }
}
