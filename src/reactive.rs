//! Reactive surface: credit windows, producer sinks, payload streams.
//!
//! This is the narrow producer/consumer contract the stream machine exposes
//! to application code; there is deliberately no general-purpose operator
//! library here.
//!
//! - [`CreditWindow`] is the request-n accounting: a producer acquires one
//!   permit per PAYLOAD(NEXT), REQUEST_N grants more, CANCEL closes it.
//! - [`ProducerSink`] is handed to responder handlers (and to the requester
//!   half of a channel): `next` suspends at zero credit, `complete`/`error`
//!   are idempotent terminals.
//! - [`PayloadStream`] is the consumer: an async sequence of payloads ending
//!   in exactly one terminal; dropping it before the terminal cancels the
//!   stream on the wire.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::error::{ErrorCode, RSocketError, Result};
use crate::frame::{Frame, MAX_REQUEST_N};
use crate::payload::Payload;
use crate::socket::registry::{StreamRegistry, StreamSignal, StreamSlot};
use crate::socket::writer::FrameSender;

/// Request-n credit for one direction of one stream.
///
/// Backed by a semaphore: available permits are the frames the producer may
/// still emit. Grants saturate at 2^31-1. Closing the window (CANCEL) makes
/// every pending and future acquire fail with `Canceled`.
pub struct CreditWindow {
    sem: Semaphore,
}

impl CreditWindow {
    /// Create a window with `initial` credit.
    pub fn new(initial: u32) -> Self {
        Self {
            sem: Semaphore::new(initial as usize),
        }
    }

    /// Add `n` credit, saturating at 2^31-1.
    pub fn grant(&self, n: u32) {
        let available = self.sem.available_permits();
        let room = (MAX_REQUEST_N as usize).saturating_sub(available);
        let add = room.min(n as usize);
        if add > 0 {
            self.sem.add_permits(add);
        }
    }

    /// Consume one credit, suspending until granted or the window closes.
    pub async fn acquire(&self) -> Result<()> {
        match self.sem.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(RSocketError::Canceled),
        }
    }

    /// Consume one credit without suspending.
    pub fn try_acquire(&self) -> bool {
        match self.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Close the window; producers observe `Canceled`.
    pub fn close(&self) {
        self.sem.close();
    }

    /// Whether the window is closed.
    pub fn is_closed(&self) -> bool {
        self.sem.is_closed()
    }

    /// Currently available credit.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

/// Producer half of a stream: emits payloads under credit.
///
/// Cloneable; all clones share the same stream and terminal state.
#[derive(Clone)]
pub struct ProducerSink {
    slot: Arc<StreamSlot>,
    registry: Arc<StreamRegistry>,
    sender: FrameSender,
    mtu: Option<usize>,
}

impl ProducerSink {
    pub(crate) fn new(
        slot: Arc<StreamSlot>,
        registry: Arc<StreamRegistry>,
        sender: FrameSender,
        mtu: Option<usize>,
    ) -> Self {
        Self {
            slot,
            registry,
            sender,
            mtu,
        }
    }

    /// Stream id this sink produces on.
    pub fn stream_id(&self) -> u32 {
        self.slot.id
    }

    /// Emit one element.
    ///
    /// Suspends while the credit window is empty; fails with `Canceled` once
    /// the stream was canceled, and with a protocol error after a terminal
    /// was already produced.
    pub async fn next(&self, payload: Payload) -> Result<()> {
        if self.slot.is_canceled() {
            return Err(RSocketError::Canceled);
        }
        if self.slot.local_completed() {
            return Err(RSocketError::Protocol(
                "stream already completed by this producer".to_string(),
            ));
        }
        self.slot.window.acquire().await?;
        if self.slot.is_canceled() {
            return Err(RSocketError::Canceled);
        }
        self.sender
            .send_with_mtu(Frame::payload_next(self.slot.id, payload), self.mtu)
            .await
    }

    /// Complete this half of the stream. Idempotent; a no-op after `error`
    /// or cancellation.
    pub async fn complete(&self) -> Result<()> {
        if self.slot.is_canceled() {
            return Ok(());
        }
        match self.slot.complete_local() {
            None => Ok(()),
            Some(fully) => {
                self.sender
                    .send(Frame::payload_complete(self.slot.id))
                    .await?;
                if fully {
                    self.registry.remove(self.slot.id);
                }
                Ok(())
            }
        }
    }

    /// Fail this stream with APPLICATION_ERROR. Idempotent; a no-op after
    /// `complete` or cancellation. An error terminates the whole stream,
    /// not just this half.
    pub async fn error(&self, message: &str) -> Result<()> {
        if self.slot.is_canceled() {
            return Ok(());
        }
        match self.slot.complete_local() {
            None => Ok(()),
            Some(_) => {
                self.slot.fail_local();
                self.slot.deliver(StreamSignal::Error(RSocketError::Remote {
                    code: ErrorCode::ApplicationError,
                    message: message.to_string(),
                }));
                self.sender
                    .send(Frame::error(
                        self.slot.id,
                        ErrorCode::ApplicationError,
                        message,
                    ))
                    .await?;
                self.registry.remove(self.slot.id);
                Ok(())
            }
        }
    }
}

/// Consumer half of a stream: an async sequence of payloads.
///
/// Yields elements in frame arrival order and ends after exactly one
/// terminal: `None` after clean completion, `Some(Err(_))` once on error.
/// Dropping the stream before its terminal cancels it on the wire.
pub struct PayloadStream {
    slot: Arc<StreamSlot>,
    registry: Arc<StreamRegistry>,
    sender: FrameSender,
    rx: mpsc::UnboundedReceiver<StreamSignal>,
    terminated: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        slot: Arc<StreamSlot>,
        registry: Arc<StreamRegistry>,
        sender: FrameSender,
        rx: mpsc::UnboundedReceiver<StreamSignal>,
    ) -> Self {
        Self {
            slot,
            registry,
            sender,
            rx,
            terminated: false,
        }
    }

    /// Stream id this consumer listens on.
    pub fn stream_id(&self) -> u32 {
        self.slot.id
    }

    /// Await the next element.
    ///
    /// `None` after the terminal; `Some(Err(_))` delivers the terminal
    /// error exactly once.
    pub async fn next(&mut self) -> Option<Result<Payload>> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamSignal::Next(payload)) => Some(Ok(payload)),
            Some(StreamSignal::Complete) | None => {
                self.terminated = true;
                None
            }
            Some(StreamSignal::Error(e)) => {
                self.terminated = true;
                Some(Err(e))
            }
        }
    }

    /// Grant the producer `n` more frames of credit (emits REQUEST_N).
    pub async fn request(&self, n: u32) -> Result<()> {
        if self.terminated || n == 0 {
            return Ok(());
        }
        self.sender.send(Frame::request_n(self.slot.id, n)).await
    }

    /// Cancel the stream (emits CANCEL). Terminates both halves.
    pub async fn cancel(&mut self) {
        if self.terminated || self.slot.is_terminated() {
            self.terminated = true;
            return;
        }
        self.terminated = true;
        self.slot.cancel();
        self.registry.remove(self.slot.id);
        if let Err(e) = self.sender.send(Frame::cancel(self.slot.id)).await {
            tracing::debug!("CANCEL not sent on closed connection: {}", e);
        }
    }

    /// Collect every remaining element until clean completion.
    pub async fn collect(mut self) -> Result<Vec<Payload>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        if self.terminated || self.slot.is_terminated() {
            return;
        }
        self.slot.cancel();
        self.registry.remove(self.slot.id);
        if self.sender.try_send(Frame::cancel(self.slot.id)).is_err() {
            tracing::debug!(
                stream_id = self.slot.id,
                "CANCEL for dropped stream not queued"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_window_acquire_and_grant() {
        let window = CreditWindow::new(2);
        assert!(window.try_acquire());
        assert!(window.try_acquire());
        assert!(!window.try_acquire());

        window.grant(1);
        window.acquire().await.unwrap();
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn test_window_grant_saturates() {
        let window = CreditWindow::new(MAX_REQUEST_N - 1);
        window.grant(100);
        assert_eq!(window.available(), MAX_REQUEST_N as usize);
        window.grant(u32::MAX);
        assert_eq!(window.available(), MAX_REQUEST_N as usize);
    }

    #[tokio::test]
    async fn test_window_close_fails_acquire() {
        let window = Arc::new(CreditWindow::new(0));
        let w = window.clone();
        let waiter = tokio::spawn(async move { w.acquire().await });
        tokio::task::yield_now().await;

        window.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RSocketError::Canceled)));
        assert!(window.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_acquire_parks_until_grant() {
        let window = Arc::new(CreditWindow::new(0));
        let w = window.clone();
        let waiter = tokio::spawn(async move { w.acquire().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "producer must park at zero credit");

        window.grant(1);
        waiter.await.unwrap().unwrap();
    }
}
