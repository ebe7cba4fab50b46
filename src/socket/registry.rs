//! Stream registry: id allocation, per-stream slots, lifecycle bookkeeping.
//!
//! A slot is created on the first local request send or first remote request
//! receive and holds everything both the dispatcher and the reactive surface
//! touch: the outbound credit window, the ordered inbound signal queue, and
//! the half-close/cancel flags the state machine is computed from. The slot
//! is jointly referenced by the registry and by any outstanding sink or
//! stream; the id is never reused within a connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::RSocketError;
use crate::frame::MAX_STREAM_ID;
use crate::payload::Payload;
use crate::reactive::CreditWindow;

/// Interaction model of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// REQUEST_FNF.
    FireAndForget,
    /// REQUEST_RESPONSE.
    RequestResponse,
    /// REQUEST_STREAM.
    RequestStream,
    /// REQUEST_CHANNEL.
    RequestChannel,
}

/// Which side of the interaction this peer plays for a given stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// We initiated the stream.
    Requester,
    /// The peer initiated the stream.
    Responder,
}

/// Observable lifecycle state, computed from the slot's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request sent or received, no payload seen yet.
    Requested,
    /// At least one payload delivered.
    Active,
    /// Our half completed, the peer's still open.
    HalfClosedLocal,
    /// The peer's half completed, ours still open.
    HalfClosedRemote,
    /// Terminal: completed both ways, errored, or canceled.
    Terminated,
}

/// Ordered event delivered to a stream's consumer.
#[derive(Debug)]
pub enum StreamSignal {
    /// A payload element.
    Next(Payload),
    /// Clean completion of the producing half.
    Complete,
    /// Terminal error.
    Error(RSocketError),
}

/// Per-stream shared state.
pub struct StreamSlot {
    /// Stream id.
    pub id: u32,
    /// Interaction model.
    pub kind: StreamKind,
    /// Our role on this stream.
    pub role: StreamRole,
    /// Credit window gating the local producer.
    pub window: Arc<CreditWindow>,
    inbound: mpsc::UnboundedSender<StreamSignal>,
    local_complete: AtomicBool,
    remote_complete: AtomicBool,
    canceled: AtomicBool,
    saw_payload: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl StreamSlot {
    /// Create a slot plus the receiving end of its inbound queue.
    ///
    /// Halves with nothing to produce start completed: a fire-and-forget has
    /// neither half open, a request/response requester only listens, a
    /// request/stream responder only speaks.
    pub fn new(
        id: u32,
        kind: StreamKind,
        role: StreamRole,
        window: Arc<CreditWindow>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (local_done, remote_done) = match (kind, role) {
            (StreamKind::FireAndForget, _) => (true, true),
            (StreamKind::RequestResponse, StreamRole::Requester) => (true, false),
            (StreamKind::RequestResponse, StreamRole::Responder) => (false, true),
            (StreamKind::RequestStream, StreamRole::Requester) => (true, false),
            (StreamKind::RequestStream, StreamRole::Responder) => (false, true),
            (StreamKind::RequestChannel, _) => (false, false),
        };
        let slot = Arc::new(Self {
            id,
            kind,
            role,
            window,
            inbound: tx,
            local_complete: AtomicBool::new(local_done),
            remote_complete: AtomicBool::new(remote_done),
            canceled: AtomicBool::new(false),
            saw_payload: AtomicBool::new(false),
            abort: Mutex::new(None),
        });
        (slot, rx)
    }

    /// Attach the responder task handle so CANCEL can abort it.
    pub fn set_abort(&self, handle: AbortHandle) {
        *self.abort.lock().expect("abort lock") = Some(handle);
    }

    /// Queue a signal for the consumer; silently dropped once the consumer
    /// is gone.
    pub fn deliver(&self, signal: StreamSignal) {
        if matches!(signal, StreamSignal::Next(_)) {
            self.saw_payload.store(true, Ordering::Release);
        }
        let _ = self.inbound.send(signal);
    }

    /// Mark our producing half complete.
    ///
    /// `None` when already latched (idempotent repeat); otherwise whether
    /// this call made the whole stream terminal.
    pub fn complete_local(&self) -> Option<bool> {
        if self.local_complete.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.remote_complete.load(Ordering::Acquire))
    }

    /// Mark the peer's producing half complete.
    ///
    /// `None` when already latched; otherwise whether this call made the
    /// whole stream terminal.
    pub fn complete_remote(&self) -> Option<bool> {
        if self.remote_complete.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.local_complete.load(Ordering::Acquire))
    }

    /// Terminal error raised by the local producer: both halves close and
    /// the window closes, but the producing task keeps running so it can
    /// observe the result of its own `error` call.
    pub fn fail_local(&self) {
        self.local_complete.store(true, Ordering::Release);
        self.remote_complete.store(true, Ordering::Release);
        self.window.close();
    }

    /// Terminal cancellation: closes the credit window (a parked producer
    /// fails with `Canceled`) and aborts any responder task.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.local_complete.store(true, Ordering::Release);
        self.remote_complete.store(true, Ordering::Release);
        self.window.close();
        if let Some(handle) = self.abort.lock().expect("abort lock").take() {
            handle.abort();
        }
    }

    /// Whether CANCEL terminated this stream.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Whether our half already completed.
    pub fn local_completed(&self) -> bool {
        self.local_complete.load(Ordering::Acquire)
    }

    /// Whether the peer's half already completed.
    pub fn remote_completed(&self) -> bool {
        self.remote_complete.load(Ordering::Acquire)
    }

    /// Whether the stream reached its terminal state.
    pub fn is_terminated(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
            || (self.local_complete.load(Ordering::Acquire)
                && self.remote_complete.load(Ordering::Acquire))
    }

    /// Computed lifecycle state.
    pub fn state(&self) -> StreamState {
        if self.is_terminated() {
            return StreamState::Terminated;
        }
        match (
            self.local_complete.load(Ordering::Acquire),
            self.remote_complete.load(Ordering::Acquire),
        ) {
            (true, false) => {
                // A listening-only half doesn't count as a half-close for
                // observation: a fresh request/stream requester is
                // Requested, not HalfClosedLocal.
                match (self.kind, self.role) {
                    (StreamKind::RequestChannel, _)
                    | (StreamKind::RequestResponse, StreamRole::Responder)
                    | (StreamKind::RequestStream, StreamRole::Responder) => {
                        StreamState::HalfClosedLocal
                    }
                    _ => {
                        if self.saw_payload.load(Ordering::Acquire) {
                            StreamState::Active
                        } else {
                            StreamState::Requested
                        }
                    }
                }
            }
            (false, true) => match (self.kind, self.role) {
                (StreamKind::RequestChannel, _) => StreamState::HalfClosedRemote,
                _ => {
                    if self.saw_payload.load(Ordering::Acquire) {
                        StreamState::Active
                    } else {
                        StreamState::Requested
                    }
                }
            },
            _ => {
                if self.saw_payload.load(Ordering::Acquire) {
                    StreamState::Active
                } else {
                    StreamState::Requested
                }
            }
        }
    }
}

/// Requester-side stream id allocator.
///
/// The client requester uses odd ids from 1, the server requester even ids
/// from 2; ids are never reused within a connection.
pub struct StreamIds {
    next: AtomicU32,
}

impl StreamIds {
    /// Allocator for the client side.
    pub fn client() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Allocator for the server side.
    pub fn server() -> Self {
        Self {
            next: AtomicU32::new(2),
        }
    }

    /// Allocate the next id.
    pub fn next(&self) -> crate::error::Result<u32> {
        let id = self.next.fetch_add(2, Ordering::AcqRel);
        if id > MAX_STREAM_ID {
            return Err(RSocketError::Protocol(
                "stream ids exhausted for this connection".to_string(),
            ));
        }
        Ok(id)
    }
}

/// Map from live stream id to slot, shared by dispatcher and surface.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<u32, Arc<StreamSlot>>>,
}

impl StreamRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a slot. Returns false when the id is already live.
    pub fn register(&self, slot: Arc<StreamSlot>) -> bool {
        let mut streams = self.streams.lock().expect("registry lock");
        if streams.contains_key(&slot.id) {
            return false;
        }
        streams.insert(slot.id, slot);
        true
    }

    /// Look up a live stream.
    pub fn get(&self, id: u32) -> Option<Arc<StreamSlot>> {
        self.streams.lock().expect("registry lock").get(&id).cloned()
    }

    /// Remove a stream, returning its slot if it was live.
    pub fn remove(&self, id: u32) -> Option<Arc<StreamSlot>> {
        self.streams.lock().expect("registry lock").remove(&id)
    }

    /// Remove and return every live stream (connection teardown).
    pub fn drain(&self) -> Vec<Arc<StreamSlot>> {
        let mut streams = self.streams.lock().expect("registry lock");
        streams.drain().map(|(_, slot)| slot).collect()
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.lock().expect("registry lock").len()
    }

    /// Whether no streams are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
