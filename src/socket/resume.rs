//! Resume bookkeeping: position counters and the sent-frame replay buffer.
//!
//! Positions count the encoded bytes of every frame sent and received on the
//! logical connection. The replay buffer keeps sent frames until the peer
//! acknowledges their position (KEEPALIVE body, RESUME_OK), bounded by a
//! byte budget; once the budget is exceeded the oldest frames are dropped
//! and a resume from before the drop point becomes impossible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::frame::Frame;

/// Default replay buffer budget (4 MiB).
pub const DEFAULT_REPLAY_BUDGET: usize = 4 * 1024 * 1024;

/// Connection position counters, all in bytes of encoded frames.
#[derive(Debug, Default)]
pub struct Positions {
    sent: AtomicU64,
    received: AtomicU64,
    peer_received: AtomicU64,
}

impl Positions {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `len` sent bytes; returns the position *before* this frame.
    pub fn record_sent(&self, len: usize) -> u64 {
        self.sent.fetch_add(len as u64, Ordering::AcqRel)
    }

    /// Record `len` received bytes.
    pub fn record_received(&self, len: usize) {
        self.received.fetch_add(len as u64, Ordering::AcqRel);
    }

    /// Bytes sent so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Bytes received so far; this is the value KEEPALIVE advertises.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Record the peer's acknowledged receive position.
    pub fn set_peer_received(&self, position: u64) {
        // Positions only move forward; ignore reordered acknowledgements.
        self.peer_received.fetch_max(position, Ordering::AcqRel);
    }

    /// Latest acknowledged peer position.
    pub fn peer_received(&self) -> u64 {
        self.peer_received.load(Ordering::Acquire)
    }
}

struct ReplayInner {
    /// Sent frames with the position of their first byte.
    frames: VecDeque<(u64, Frame)>,
    /// Position of the first byte still buffered.
    first_available: u64,
    /// Position the next pushed frame starts at.
    next_position: u64,
    /// Bytes currently buffered.
    buffered: usize,
}

/// Bounded buffer of sent frames for resume retransmission.
pub struct ReplayBuffer {
    inner: Mutex<ReplayInner>,
    budget: usize,
}

impl ReplayBuffer {
    /// Create a replay buffer with the given byte budget.
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(ReplayInner {
                frames: VecDeque::new(),
                first_available: 0,
                next_position: 0,
                buffered: 0,
            }),
            budget,
        }
    }

    /// Record a sent frame.
    pub fn push(&self, frame: Frame) {
        let len = frame.len();
        let mut inner = self.inner.lock().expect("replay lock");
        let position = inner.next_position;
        inner.next_position += len as u64;
        inner.frames.push_back((position, frame));
        inner.buffered += len;

        while inner.buffered > self.budget {
            if let Some((pos, dropped)) = inner.frames.pop_front() {
                let dropped_len = dropped.len();
                inner.buffered -= dropped_len;
                inner.first_available = pos + dropped_len as u64;
            } else {
                break;
            }
        }
    }

    /// Drop frames the peer has fully received.
    pub fn prune_to(&self, position: u64) {
        let mut inner = self.inner.lock().expect("replay lock");
        loop {
            let end = match inner.frames.front() {
                Some((pos, frame)) => {
                    let end = *pos + frame.len() as u64;
                    if end > position {
                        break;
                    }
                    end
                }
                None => break,
            };
            let (_, dropped) = inner.frames.pop_front().expect("front checked");
            inner.buffered -= dropped.len();
            inner.first_available = end;
        }
        if inner.frames.is_empty() {
            inner.first_available = inner.first_available.max(position);
        }
    }

    /// Frames to retransmit from `position` onward.
    ///
    /// `None` when `position` predates the buffer (the session cannot be
    /// resumed) or splits a frame (inconsistent positions).
    pub fn frames_from(&self, position: u64) -> Option<Vec<Frame>> {
        let inner = self.inner.lock().expect("replay lock");
        if position < inner.first_available || position > inner.next_position {
            return None;
        }
        let mut out = Vec::new();
        let mut aligned = position == inner.next_position;
        for (pos, frame) in &inner.frames {
            if *pos >= position {
                if *pos == position {
                    aligned = true;
                }
                out.push(frame.clone());
            } else if pos + (frame.len() as u64) > position {
                // Position lands inside a frame.
                return None;
            }
        }
        if !aligned && !out.is_empty() {
            return None;
        }
        Some(out)
    }

    /// Earliest position retransmission can start from.
    pub fn first_available(&self) -> u64 {
        self.inner.lock().expect("replay lock").first_available
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.lock().expect("replay lock").buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    fn frame(tag: &'static str) -> Frame {
        Frame::payload_next(1, Payload::from(tag))
    }

    #[test]
    fn test_positions_advance() {
        let positions = Positions::new();
        assert_eq!(positions.record_sent(10), 0);
        assert_eq!(positions.record_sent(5), 10);
        assert_eq!(positions.sent(), 15);

        positions.record_received(7);
        assert_eq!(positions.received(), 7);
    }

    #[test]
    fn test_peer_position_monotonic() {
        let positions = Positions::new();
        positions.set_peer_received(100);
        positions.set_peer_received(50);
        assert_eq!(positions.peer_received(), 100);
    }

    #[test]
    fn test_replay_push_and_frames_from() {
        let replay = ReplayBuffer::new(DEFAULT_REPLAY_BUDGET);
        let f1 = frame("one");
        let f2 = frame("two2");
        let len1 = f1.len() as u64;
        replay.push(f1.clone());
        replay.push(f2.clone());

        assert_eq!(
            replay.frames_from(0).unwrap(),
            vec![f1.clone(), f2.clone()]
        );
        assert_eq!(replay.frames_from(len1).unwrap(), vec![f2.clone()]);
        // End position: nothing left to send.
        assert_eq!(
            replay.frames_from(len1 + f2.len() as u64).unwrap(),
            Vec::<Frame>::new()
        );
    }

    #[test]
    fn test_replay_rejects_misaligned_position() {
        let replay = ReplayBuffer::new(DEFAULT_REPLAY_BUDGET);
        replay.push(frame("one"));
        assert!(replay.frames_from(1).is_none());
    }

    #[test]
    fn test_replay_prune() {
        let replay = ReplayBuffer::new(DEFAULT_REPLAY_BUDGET);
        let f1 = frame("one");
        let f2 = frame("two2");
        let len1 = f1.len() as u64;
        replay.push(f1);
        replay.push(f2.clone());

        replay.prune_to(len1);
        assert_eq!(replay.first_available(), len1);
        assert_eq!(replay.frames_from(len1).unwrap(), vec![f2]);
        assert!(replay.frames_from(0).is_none());
    }

    #[test]
    fn test_replay_budget_drops_oldest() {
        let f = frame("payload-data");
        let len = f.len();
        let replay = ReplayBuffer::new(len * 2);
        replay.push(f.clone());
        replay.push(f.clone());
        replay.push(f.clone());

        assert_eq!(replay.buffered(), len * 2);
        assert_eq!(replay.first_available(), len as u64);
        assert!(replay.frames_from(0).is_none());
        assert_eq!(replay.frames_from(len as u64).unwrap().len(), 2);
    }

    #[test]
    fn test_prune_beyond_buffer_moves_first_available() {
        let replay = ReplayBuffer::new(DEFAULT_REPLAY_BUDGET);
        let f = frame("x");
        let len = f.len() as u64;
        replay.push(f);
        replay.prune_to(len);
        assert_eq!(replay.first_available(), len);
        assert_eq!(replay.buffered(), 0);
    }
}
