//! Fragmentation and reassembly of logical frames via the FOLLOWS flag.
//!
//! A payload-bearing frame larger than the configured MTU is split into a
//! chain: the first fragment keeps the original frame type (and its prefix
//! fields such as `initial_request_n`), continuation fragments are PAYLOAD
//! frames on the same stream, and every fragment but the last sets FOLLOWS.
//! Metadata bytes are consumed before data bytes; flags describing the
//! logical frame (COMPLETE) ride on the final fragment.
//!
//! The [`Reassembler`] is the inbound dual: it buffers one in-flight chain
//! per stream, bounded by a configurable size, and yields the coalesced
//! logical frame when the chain ends.

use std::collections::HashMap;

use bytes::BytesMut;

use super::codec::{Frame, FrameBody};
use crate::error::{RSocketError, Result};
use crate::payload::Payload;

/// Default bound for one stream's in-flight reassembly (16 MiB).
pub const DEFAULT_MAX_REASSEMBLY_SIZE: usize = 16 * 1024 * 1024;

/// Smallest MTU that still makes fragmentation progress.
pub const MIN_FRAGMENT_MTU: usize = 64;

/// Split a frame into a FOLLOWS chain if its payload exceeds `mtu` bytes.
///
/// `mtu` bounds the payload bytes (metadata plus data) per fragment. Frames
/// that carry no payload, or fit, come back unchanged as a single-element
/// chain.
pub fn fragment(frame: Frame, mtu: usize) -> Vec<Frame> {
    let mtu = mtu.max(MIN_FRAGMENT_MTU);
    let stream_id = frame.stream_id;

    let (payload, rebuild_first, complete): (Payload, RebuildFirst, bool) = match frame.body {
        FrameBody::RequestResponse { payload, .. } => {
            (payload, RebuildFirst::RequestResponse, false)
        }
        FrameBody::RequestFnf { payload, .. } => (payload, RebuildFirst::RequestFnf, false),
        FrameBody::RequestStream {
            initial_request_n,
            payload,
            ..
        } => (
            payload,
            RebuildFirst::RequestStream { initial_request_n },
            false,
        ),
        FrameBody::RequestChannel {
            initial_request_n,
            complete,
            payload,
            ..
        } => (
            payload,
            RebuildFirst::RequestChannel { initial_request_n },
            complete,
        ),
        FrameBody::Payload {
            complete,
            next,
            payload,
            ..
        } => (payload, RebuildFirst::Payload { next }, complete),
        // Not fragmentable.
        body => return vec![Frame { stream_id, body }],
    };

    if payload.body_len() <= mtu {
        return vec![Frame {
            stream_id,
            body: rebuild_first.build(payload, false, complete),
        }];
    }

    let (metadata, data) = payload.split();
    let mut metadata = metadata.unwrap_or_default();
    let had_metadata = !metadata.is_empty();
    let mut data = data;

    let mut chunks: Vec<Payload> = Vec::new();
    while !metadata.is_empty() || !data.is_empty() || chunks.is_empty() {
        let meta_take = metadata.len().min(mtu);
        let chunk_meta = if meta_take > 0 || (had_metadata && chunks.is_empty()) {
            Some(metadata.split_to(meta_take))
        } else {
            None
        };
        let data_take = data.len().min(mtu - meta_take);
        let chunk_data = data.split_to(data_take);
        chunks.push(Payload::new(chunk_meta, chunk_data));
    }

    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let follows = i < last;
            let body = if i == 0 {
                rebuild_first.build(chunk, follows, false)
            } else {
                FrameBody::Payload {
                    follows,
                    complete: !follows && complete,
                    next: true,
                    payload: chunk,
                }
            };
            Frame { stream_id, body }
        })
        .collect()
}

/// How to rebuild the first fragment of a chain.
#[derive(Debug, Clone, Copy)]
enum RebuildFirst {
    RequestResponse,
    RequestFnf,
    RequestStream { initial_request_n: u32 },
    RequestChannel { initial_request_n: u32 },
    Payload { next: bool },
}

impl RebuildFirst {
    fn build(self, payload: Payload, follows: bool, complete: bool) -> FrameBody {
        match self {
            RebuildFirst::RequestResponse => FrameBody::RequestResponse { follows, payload },
            RebuildFirst::RequestFnf => FrameBody::RequestFnf { follows, payload },
            RebuildFirst::RequestStream { initial_request_n } => FrameBody::RequestStream {
                follows,
                initial_request_n,
                payload,
            },
            RebuildFirst::RequestChannel { initial_request_n } => FrameBody::RequestChannel {
                follows,
                complete,
                initial_request_n,
                payload,
            },
            RebuildFirst::Payload { next } => FrameBody::Payload {
                follows,
                complete,
                next,
                payload,
            },
        }
    }
}

/// One in-flight chain.
struct Partial {
    first: RebuildFirst,
    metadata: Option<BytesMut>,
    data: BytesMut,
}

impl Partial {
    fn buffered(&self) -> usize {
        self.metadata.as_ref().map(|m| m.len()).unwrap_or(0) + self.data.len()
    }
}

/// Outcome of offering a frame to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembled {
    /// The frame was complete on its own (or ended a chain): deliver it.
    Complete(Frame),
    /// The frame joined an open chain: nothing to deliver yet.
    Buffered,
}

/// Per-stream FOLLOWS-chain reassembly with a configurable size bound.
pub struct Reassembler {
    partials: HashMap<u32, Partial>,
    max_size: usize,
}

impl Reassembler {
    /// Create a reassembler with the default size bound.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_REASSEMBLY_SIZE)
    }

    /// Create a reassembler bounding each stream's buffered chain.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_size,
        }
    }

    /// Offer an inbound stream-level frame.
    ///
    /// Frames unrelated to fragmentation pass through as
    /// [`Reassembled::Complete`] — unless a chain is open for their stream,
    /// which is a connection-level protocol error, as is exceeding the
    /// buffer bound.
    pub fn offer(&mut self, frame: Frame) -> Result<Reassembled> {
        let stream_id = frame.stream_id;
        let open = self.partials.contains_key(&stream_id);

        let (first, follows, complete, payload) = match frame.body {
            FrameBody::RequestResponse { follows, payload } => {
                (RebuildFirst::RequestResponse, follows, false, payload)
            }
            FrameBody::RequestFnf { follows, payload } => {
                (RebuildFirst::RequestFnf, follows, false, payload)
            }
            FrameBody::RequestStream {
                follows,
                initial_request_n,
                payload,
            } => (
                RebuildFirst::RequestStream { initial_request_n },
                follows,
                false,
                payload,
            ),
            FrameBody::RequestChannel {
                follows,
                complete,
                initial_request_n,
                payload,
            } => (
                RebuildFirst::RequestChannel { initial_request_n },
                follows,
                complete,
                payload,
            ),
            FrameBody::Payload {
                follows,
                complete,
                next,
                payload,
            } => (RebuildFirst::Payload { next }, follows, complete, payload),
            body => {
                if open {
                    return Err(RSocketError::Protocol(format!(
                        "frame interleaved with open fragment chain on stream {}",
                        stream_id
                    )));
                }
                return Ok(Reassembled::Complete(Frame { stream_id, body }));
            }
        };

        if open {
            // Continuations must be PAYLOAD frames.
            if !matches!(first, RebuildFirst::Payload { .. }) {
                return Err(RSocketError::Protocol(format!(
                    "request frame interleaved with open fragment chain on stream {}",
                    stream_id
                )));
            }
            let partial = self
                .partials
                .get_mut(&stream_id)
                .expect("open chain checked above");

            let (meta, data) = payload.split();
            if let Some(meta) = meta {
                partial
                    .metadata
                    .get_or_insert_with(BytesMut::new)
                    .extend_from_slice(&meta);
            }
            partial.data.extend_from_slice(&data);

            if partial.buffered() > self.max_size {
                self.partials.remove(&stream_id);
                return Err(RSocketError::Protocol(format!(
                    "fragment reassembly exceeds {} bytes on stream {}",
                    self.max_size, stream_id
                )));
            }

            if follows {
                return Ok(Reassembled::Buffered);
            }

            let partial = self.partials.remove(&stream_id).expect("chain present");
            let assembled = Payload::new(
                partial.metadata.map(BytesMut::freeze),
                partial.data.freeze(),
            );
            return Ok(Reassembled::Complete(Frame {
                stream_id,
                body: partial.first.build(assembled, false, complete),
            }));
        }

        if !follows {
            // Whole logical frame in one piece.
            return Ok(Reassembled::Complete(Frame {
                stream_id,
                body: first.build(payload, false, complete),
            }));
        }

        // Chain start.
        let (meta, data) = payload.split();
        let partial = Partial {
            first,
            metadata: meta.map(|m| BytesMut::from(&m[..])),
            data: BytesMut::from(&data[..]),
        };
        if partial.buffered() > self.max_size {
            return Err(RSocketError::Protocol(format!(
                "fragment reassembly exceeds {} bytes on stream {}",
                self.max_size, stream_id
            )));
        }
        self.partials.insert(stream_id, partial);
        Ok(Reassembled::Buffered)
    }

    /// Drop any open chain for a terminated stream.
    pub fn clear(&mut self, stream_id: u32) {
        self.partials.remove(&stream_id);
    }

    /// Number of streams with an open chain.
    pub fn open_chains(&self) -> usize {
        self.partials.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reassemble_all(reassembler: &mut Reassembler, frames: Vec<Frame>) -> Frame {
        let mut out = None;
        for frame in frames {
            match reassembler.offer(frame).unwrap() {
                Reassembled::Complete(f) => {
                    assert!(out.is_none(), "more than one logical frame");
                    out = Some(f);
                }
                Reassembled::Buffered => {}
            }
        }
        out.expect("chain did not complete")
    }

    #[test]
    fn test_small_frame_untouched() {
        let frame = Frame::payload_next(1, Payload::from("small"));
        let chain = fragment(frame.clone(), 1024);
        assert_eq!(chain, vec![frame]);
    }

    #[test]
    fn test_fragment_then_reassemble_equals_original() {
        let payload = Payload::new(
            Some(Bytes::from(vec![0xAA; 150])),
            Bytes::from(vec![0xBB; 500]),
        );
        let frame = Frame::payload_next_complete(7, payload);

        let chain = fragment(frame.clone(), MIN_FRAGMENT_MTU);
        assert!(chain.len() > 1);
        // All but the last set FOLLOWS.
        for f in &chain[..chain.len() - 1] {
            assert!(matches!(
                f.body,
                FrameBody::Payload { follows: true, .. }
            ));
        }

        let mut reassembler = Reassembler::new();
        let out = reassemble_all(&mut reassembler, chain);
        assert_eq!(out, frame);
        assert_eq!(reassembler.open_chains(), 0);
    }

    #[test]
    fn test_fragmented_request_stream_keeps_initial_n() {
        let frame = Frame {
            stream_id: 5,
            body: FrameBody::RequestStream {
                follows: false,
                initial_request_n: 42,
                payload: Payload::from(Bytes::from(vec![7u8; 300])),
            },
        };
        let chain = fragment(frame.clone(), MIN_FRAGMENT_MTU);
        assert!(matches!(
            chain[0].body,
            FrameBody::RequestStream {
                follows: true,
                initial_request_n: 42,
                ..
            }
        ));

        let mut reassembler = Reassembler::new();
        assert_eq!(reassemble_all(&mut reassembler, chain), frame);
    }

    #[test]
    fn test_metadata_present_iff_any_fragment_had_it() {
        // Scenario 5: three fragments, metadata only on the first.
        let chain = vec![
            Frame {
                stream_id: 7,
                body: FrameBody::Payload {
                    follows: true,
                    complete: false,
                    next: true,
                    payload: Payload::new(
                        Some(Bytes::from_static(b"m1")),
                        Bytes::from_static(b"aaaa"),
                    ),
                },
            },
            Frame {
                stream_id: 7,
                body: FrameBody::Payload {
                    follows: true,
                    complete: false,
                    next: true,
                    payload: Payload::from("bbbb"),
                },
            },
            Frame {
                stream_id: 7,
                body: FrameBody::Payload {
                    follows: false,
                    complete: false,
                    next: true,
                    payload: Payload::from("cc"),
                },
            },
        ];

        let mut reassembler = Reassembler::new();
        let out = reassemble_all(&mut reassembler, chain);
        match out.body {
            FrameBody::Payload { payload, .. } => {
                assert_eq!(payload.data(), b"aaaabbbbcc");
                assert_eq!(payload.metadata().map(|m| &m[..]), Some(&b"m1"[..]));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_interleaved_frame_is_protocol_error() {
        let mut reassembler = Reassembler::new();
        let first = Frame {
            stream_id: 3,
            body: FrameBody::Payload {
                follows: true,
                complete: false,
                next: true,
                payload: Payload::from("part"),
            },
        };
        assert_eq!(reassembler.offer(first).unwrap(), Reassembled::Buffered);

        let unrelated = Frame::request_n(3, 1);
        assert!(reassembler.offer(unrelated).is_err());
    }

    #[test]
    fn test_other_stream_passes_through_mid_chain() {
        let mut reassembler = Reassembler::new();
        let first = Frame {
            stream_id: 3,
            body: FrameBody::Payload {
                follows: true,
                complete: false,
                next: true,
                payload: Payload::from("part"),
            },
        };
        reassembler.offer(first).unwrap();

        let other = Frame::payload_next(5, Payload::from("other"));
        assert_eq!(
            reassembler.offer(other.clone()).unwrap(),
            Reassembled::Complete(other)
        );
    }

    #[test]
    fn test_overflow_closes_chain() {
        let mut reassembler = Reassembler::with_max_size(8);
        let first = Frame {
            stream_id: 3,
            body: FrameBody::Payload {
                follows: true,
                complete: false,
                next: true,
                payload: Payload::from("eight by"),
            },
        };
        reassembler.offer(first).unwrap();

        let second = Frame {
            stream_id: 3,
            body: FrameBody::Payload {
                follows: true,
                complete: false,
                next: true,
                payload: Payload::from("overflow"),
            },
        };
        assert!(reassembler.offer(second).is_err());
        assert_eq!(reassembler.open_chains(), 0);
    }

    #[test]
    fn test_clear_drops_chain() {
        let mut reassembler = Reassembler::new();
        let first = Frame {
            stream_id: 3,
            body: FrameBody::Payload {
                follows: true,
                complete: false,
                next: true,
                payload: Payload::from("part"),
            },
        };
        reassembler.offer(first).unwrap();
        assert_eq!(reassembler.open_chains(), 1);
        reassembler.clear(3);
        assert_eq!(reassembler.open_chains(), 0);
    }

    #[test]
    fn test_complete_rides_last_fragment() {
        let frame = Frame::payload_next_complete(1, Payload::from(Bytes::from(vec![1u8; 200])));
        let chain = fragment(frame, MIN_FRAGMENT_MTU);
        let last = chain.last().unwrap();
        match &last.body {
            FrameBody::Payload {
                follows, complete, ..
            } => {
                assert!(!follows);
                assert!(complete);
            }
            other => panic!("unexpected body: {:?}", other),
        }
        for f in &chain[..chain.len() - 1] {
            match &f.body {
                FrameBody::Payload { complete, .. } => assert!(!complete),
                FrameBody::RequestResponse { .. } => {}
                _ => {}
            }
        }
    }
}
