//! Dedicated writer task for outbound frames.
//!
//! All producers — request methods, sinks, the dispatcher's replies, the
//! keepalive driver — feed one bounded mpsc channel per connection; a single
//! task drains it, encodes, and flushes. A full queue suspends senders,
//! which is the connection-level backpressure. The channel behind
//! [`FrameSender`] is swappable so a resumed session can point every
//! existing handle at a fresh transport.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::resume::{Positions, ReplayBuffer};
use crate::error::{RSocketError, Result};
use crate::frame::{fragment, Frame};
use crate::transport::ConnectionWriter;

/// Default outbound queue capacity, in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Frames drained per flush.
const MAX_BATCH_SIZE: usize = 64;

/// Cloneable handle feeding the writer task.
///
/// The inner channel is behind a mutex so a session resume can swap in a new
/// transport without invalidating handles held by live sinks and streams.
#[derive(Clone)]
pub struct FrameSender {
    inner: Arc<Mutex<mpsc::Sender<Frame>>>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tx)),
        }
    }

    fn current(&self) -> mpsc::Sender<Frame> {
        self.inner.lock().expect("sender lock").clone()
    }

    /// Point all handles at a new writer task's channel.
    pub(crate) fn swap(&self, tx: mpsc::Sender<Frame>) {
        *self.inner.lock().expect("sender lock") = tx;
    }

    /// Queue a frame, suspending while the queue is full.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.current()
            .send(frame)
            .await
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    /// Queue a frame without suspending; used from drop paths.
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        self.current().try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => RSocketError::ConnectionClosed,
            mpsc::error::TrySendError::Full(_) => {
                RSocketError::Protocol("outbound queue full".to_string())
            }
        })
    }

    /// Queue a frame, splitting it into a FOLLOWS chain when an MTU is set.
    pub async fn send_with_mtu(&self, frame: Frame, mtu: Option<usize>) -> Result<()> {
        match mtu {
            Some(mtu) => {
                for part in fragment(frame, mtu) {
                    self.send(part).await?;
                }
                Ok(())
            }
            None => self.send(frame).await,
        }
    }
}

/// Spawn a writer task over a fresh channel.
///
/// Every written frame advances the sent position and, when resume is
/// enabled, lands in the replay buffer before it reaches the transport.
pub(crate) fn spawn_writer(
    writer: ConnectionWriter,
    capacity: usize,
    positions: Arc<Positions>,
    replay: Option<Arc<ReplayBuffer>>,
) -> (mpsc::Sender<Frame>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(writer_loop(rx, writer, positions, replay));
    (tx, task)
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Frame>,
    mut writer: ConnectionWriter,
    positions: Arc<Positions>,
    replay: Option<Arc<ReplayBuffer>>,
) -> Result<()> {
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => {
                // All senders gone: orderly shutdown.
                let _ = writer.close().await;
                return Ok(());
            }
        };

        let mut wrote = 0usize;
        let mut next = Some(first);
        while let Some(frame) = next.take() {
            positions.record_sent(frame.len());
            if let Some(replay) = &replay {
                replay.push(frame.clone());
            }
            writer.write_frame(&frame).await?;
            wrote += 1;
            if wrote < MAX_BATCH_SIZE {
                next = rx.try_recv().ok();
            }
        }
        writer.flush().await?;
    }
}
