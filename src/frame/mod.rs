//! Frame layer: header, typed codec, length-prefix buffering, fragmentation.
//!
//! The wire unit is a 6-byte header plus a type-dependent body (§ the
//! RSocket 1.0 framing). [`Frame`] is the decoded, typed value; the codec is
//! pure functions so the same frames flow over the length-prefixed TCP
//! binding and the message-framed WebSocket binding unchanged.

mod buffer;
mod codec;
mod fragment;
mod header;

pub use buffer::{encode_prefixed, FrameBuffer, DEFAULT_MAX_FRAME_SIZE, PREFIX_SIZE};
pub use codec::{decode, Frame, FrameBody, VERSION};
pub use fragment::{
    fragment, Reassembled, Reassembler, DEFAULT_MAX_REASSEMBLY_SIZE, MIN_FRAGMENT_MTU,
};
pub use header::{
    flags, validate_request_n, FrameHeader, FrameType, CONNECTION_STREAM_ID, HEADER_SIZE,
    MAX_REQUEST_N, MAX_STREAM_ID,
};
