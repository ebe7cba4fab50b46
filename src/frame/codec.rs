//! Frame encoding and decoding.
//!
//! A decoded frame is a single-layer tagged value: [`Frame`] couples the
//! stream id with a [`FrameBody`] variant per frame type. The codec is pure:
//! [`Frame::encode`] produces the exact wire bytes (header plus type-specific
//! body) and [`decode`] reverses it, so `decode(encode(f)) == f` for every
//! representable frame.
//!
//! Flags that carry meaning (METADATA, FOLLOWS, COMPLETE, NEXT, RESPOND,
//! LEASE, RESUME_ENABLE) are not stored raw: they are derived from the body
//! on encode and folded into it on decode.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{flags, validate_request_n, FrameHeader, FrameType, HEADER_SIZE};
use crate::error::{ErrorCode, RSocketError, Result};
use crate::payload::Payload;

/// Protocol version sent in SETUP and RESUME.
pub const VERSION: (u16, u16) = (1, 0);

/// A complete protocol frame: stream id plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream identifier (0 = connection level).
    pub stream_id: u32,
    /// Typed frame body.
    pub body: FrameBody,
}

/// Typed body of a frame, one variant per frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// SETUP: connection parameters, first frame from the client.
    Setup {
        /// Protocol version, `{1, 0}` for this implementation.
        version: (u16, u16),
        /// Keepalive tick interval in milliseconds.
        keepalive_millis: u32,
        /// Max lifetime without a received frame, in milliseconds.
        max_lifetime_millis: u32,
        /// The client honors LEASE frames.
        lease: bool,
        /// Resume token, present iff RESUME_ENABLE.
        resume_token: Option<Bytes>,
        /// MIME type of payload metadata.
        metadata_mime: String,
        /// MIME type of payload data.
        data_mime: String,
        /// Setup payload handed to the acceptor.
        payload: Payload,
    },
    /// LEASE: time- and count-bounded request grant.
    Lease {
        /// Validity of the grant in milliseconds.
        ttl_millis: u32,
        /// Number of requests the grant covers.
        number_of_requests: u32,
        /// Optional lease metadata.
        metadata: Option<Bytes>,
    },
    /// KEEPALIVE: liveness probe and position acknowledgement.
    Keepalive {
        /// The receiver must reply with RESPOND cleared.
        respond: bool,
        /// Sender's resume position of received bytes.
        last_received_position: u64,
        /// Opaque probe data, echoed by the reply.
        data: Bytes,
    },
    /// REQUEST_RESPONSE: single-response request.
    RequestResponse {
        /// More fragments of this request follow.
        follows: bool,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_FNF: fire-and-forget request.
    RequestFnf {
        /// More fragments of this request follow.
        follows: bool,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_STREAM: many-response request.
    RequestStream {
        /// More fragments of this request follow.
        follows: bool,
        /// Initial credit granted to the responder.
        initial_request_n: u32,
        /// Request payload.
        payload: Payload,
    },
    /// REQUEST_CHANNEL: bidirectional request.
    RequestChannel {
        /// More fragments of this request follow.
        follows: bool,
        /// The requester completes its half with this first payload.
        complete: bool,
        /// Initial credit granted to the responder.
        initial_request_n: u32,
        /// First payload of the requester's half.
        payload: Payload,
    },
    /// REQUEST_N: credit grant.
    RequestN {
        /// Additional frames the producer may emit.
        n: u32,
    },
    /// CANCEL: terminate the request, empty body.
    Cancel,
    /// PAYLOAD: stream element and/or completion.
    Payload {
        /// More fragments of this payload follow.
        follows: bool,
        /// Terminal completion of the producer's half.
        complete: bool,
        /// An element is present.
        next: bool,
        /// The element (empty when `next` is unset).
        payload: Payload,
    },
    /// ERROR: connection- or stream-scoped failure.
    Error {
        /// Wire error code.
        code: ErrorCode,
        /// UTF-8 error explanation.
        data: Bytes,
    },
    /// METADATA_PUSH: fire-and-forget connection metadata.
    MetadataPush {
        /// Pushed metadata bytes.
        metadata: Bytes,
    },
    /// RESUME: reattach a prior session, first frame on the new transport.
    Resume {
        /// Session token from SETUP.
        token: Bytes,
        /// Client's position of received server bytes.
        last_received_server_position: u64,
        /// Earliest position the client can retransmit from.
        first_available_client_position: u64,
    },
    /// RESUME_OK: server accepts the resume attempt.
    ResumeOk {
        /// Server's position of received client bytes.
        last_received_client_position: u64,
    },
}

impl Frame {
    /// Frame type of this body.
    pub fn frame_type(&self) -> FrameType {
        match self.body {
            FrameBody::Setup { .. } => FrameType::Setup,
            FrameBody::Lease { .. } => FrameType::Lease,
            FrameBody::Keepalive { .. } => FrameType::Keepalive,
            FrameBody::RequestResponse { .. } => FrameType::RequestResponse,
            FrameBody::RequestFnf { .. } => FrameType::RequestFnf,
            FrameBody::RequestStream { .. } => FrameType::RequestStream,
            FrameBody::RequestChannel { .. } => FrameType::RequestChannel,
            FrameBody::RequestN { .. } => FrameType::RequestN,
            FrameBody::Cancel => FrameType::Cancel,
            FrameBody::Payload { .. } => FrameType::Payload,
            FrameBody::Error { .. } => FrameType::Error,
            FrameBody::MetadataPush { .. } => FrameType::MetadataPush,
            FrameBody::Resume { .. } => FrameType::Resume,
            FrameBody::ResumeOk { .. } => FrameType::ResumeOk,
        }
    }

    /// Flags derived from the body.
    pub fn flags(&self) -> u16 {
        let mut f = 0u16;
        match &self.body {
            FrameBody::Setup {
                lease,
                resume_token,
                payload,
                ..
            } => {
                if *lease {
                    f |= flags::LEASE;
                }
                if resume_token.is_some() {
                    f |= flags::RESUME_ENABLE;
                }
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
            }
            FrameBody::Lease { metadata, .. } => {
                if metadata.is_some() {
                    f |= flags::METADATA;
                }
            }
            FrameBody::Keepalive { respond, .. } => {
                if *respond {
                    f |= flags::RESPOND;
                }
            }
            FrameBody::RequestResponse { follows, payload }
            | FrameBody::RequestFnf { follows, payload } => {
                if *follows {
                    f |= flags::FOLLOWS;
                }
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
            }
            FrameBody::RequestStream {
                follows, payload, ..
            } => {
                if *follows {
                    f |= flags::FOLLOWS;
                }
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
            }
            FrameBody::RequestChannel {
                follows,
                complete,
                payload,
                ..
            } => {
                if *follows {
                    f |= flags::FOLLOWS;
                }
                if *complete {
                    f |= flags::COMPLETE;
                }
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
            }
            FrameBody::Payload {
                follows,
                complete,
                next,
                payload,
            } => {
                if *follows {
                    f |= flags::FOLLOWS;
                }
                if *complete {
                    f |= flags::COMPLETE;
                }
                if *next {
                    f |= flags::NEXT;
                }
                if payload.has_metadata() {
                    f |= flags::METADATA;
                }
            }
            FrameBody::MetadataPush { .. } => {
                f |= flags::METADATA;
            }
            FrameBody::RequestN { .. }
            | FrameBody::Cancel
            | FrameBody::Error { .. }
            | FrameBody::Resume { .. }
            | FrameBody::ResumeOk { .. } => {}
        }
        f
    }

    /// Exact encoded length (header plus body) in bytes.
    ///
    /// This value feeds the resume position counters and the TCP length
    /// prefix, so it must agree with [`Frame::encode`] to the byte.
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// Whether the encoded frame is only a header.
    pub fn is_empty(&self) -> bool {
        self.body_len() == 0
    }

    fn body_len(&self) -> usize {
        fn payload_len(p: &Payload) -> usize {
            p.body_len() + if p.has_metadata() { 3 } else { 0 }
        }
        match &self.body {
            FrameBody::Setup {
                resume_token,
                metadata_mime,
                data_mime,
                payload,
                ..
            } => {
                12 + resume_token.as_ref().map(|t| 2 + t.len()).unwrap_or(0)
                    + 1
                    + metadata_mime.len()
                    + 1
                    + data_mime.len()
                    + payload_len(payload)
            }
            FrameBody::Lease { metadata, .. } => {
                8 + metadata.as_ref().map(|m| m.len()).unwrap_or(0)
            }
            FrameBody::Keepalive { data, .. } => 8 + data.len(),
            FrameBody::RequestResponse { payload, .. }
            | FrameBody::RequestFnf { payload, .. }
            | FrameBody::Payload { payload, .. } => payload_len(payload),
            FrameBody::RequestStream { payload, .. }
            | FrameBody::RequestChannel { payload, .. } => 4 + payload_len(payload),
            FrameBody::RequestN { .. } => 4,
            FrameBody::Cancel => 0,
            FrameBody::Error { data, .. } => 4 + data.len(),
            FrameBody::MetadataPush { metadata } => metadata.len(),
            FrameBody::Resume { token, .. } => 6 + token.len() + 16,
            FrameBody::ResumeOk { .. } => 8,
        }
    }

    /// Encode to the exact wire byte sequence.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        let header = FrameHeader::new(self.stream_id, self.frame_type(), self.flags());
        buf.put_slice(&header.encode());

        fn put_payload(buf: &mut BytesMut, p: &Payload) {
            if let Some(metadata) = p.metadata() {
                buf.put_uint(metadata.len() as u64, 3);
                buf.put_slice(metadata);
            }
            buf.put_slice(p.data());
        }

        match &self.body {
            FrameBody::Setup {
                version,
                keepalive_millis,
                max_lifetime_millis,
                resume_token,
                metadata_mime,
                data_mime,
                payload,
                ..
            } => {
                buf.put_u16(version.0);
                buf.put_u16(version.1);
                buf.put_u32(*keepalive_millis);
                buf.put_u32(*max_lifetime_millis);
                if let Some(token) = resume_token {
                    buf.put_u16(token.len() as u16);
                    buf.put_slice(token);
                }
                buf.put_u8(metadata_mime.len() as u8);
                buf.put_slice(metadata_mime.as_bytes());
                buf.put_u8(data_mime.len() as u8);
                buf.put_slice(data_mime.as_bytes());
                put_payload(&mut buf, payload);
            }
            FrameBody::Lease {
                ttl_millis,
                number_of_requests,
                metadata,
            } => {
                buf.put_u32(*ttl_millis);
                buf.put_u32(*number_of_requests);
                if let Some(metadata) = metadata {
                    buf.put_slice(metadata);
                }
            }
            FrameBody::Keepalive {
                last_received_position,
                data,
                ..
            } => {
                buf.put_u64(*last_received_position);
                buf.put_slice(data);
            }
            FrameBody::RequestResponse { payload, .. }
            | FrameBody::RequestFnf { payload, .. }
            | FrameBody::Payload { payload, .. } => {
                put_payload(&mut buf, payload);
            }
            FrameBody::RequestStream {
                initial_request_n,
                payload,
                ..
            }
            | FrameBody::RequestChannel {
                initial_request_n,
                payload,
                ..
            } => {
                buf.put_u32(*initial_request_n);
                put_payload(&mut buf, payload);
            }
            FrameBody::RequestN { n } => {
                buf.put_u32(*n);
            }
            FrameBody::Cancel => {}
            FrameBody::Error { code, data } => {
                buf.put_u32(code.value());
                buf.put_slice(data);
            }
            FrameBody::MetadataPush { metadata } => {
                buf.put_slice(metadata);
            }
            FrameBody::Resume {
                token,
                last_received_server_position,
                first_available_client_position,
            } => {
                buf.put_u16(VERSION.0);
                buf.put_u16(VERSION.1);
                buf.put_u16(token.len() as u16);
                buf.put_slice(token);
                buf.put_u64(*last_received_server_position);
                buf.put_u64(*first_available_client_position);
            }
            FrameBody::ResumeOk {
                last_received_client_position,
            } => {
                buf.put_u64(*last_received_client_position);
            }
        }

        debug_assert_eq!(buf.len(), self.len());
        buf.freeze()
    }

    // Convenience constructors used throughout the socket layer.

    /// A PAYLOAD(NEXT) element.
    pub fn payload_next(stream_id: u32, payload: Payload) -> Self {
        Frame {
            stream_id,
            body: FrameBody::Payload {
                follows: false,
                complete: false,
                next: true,
                payload,
            },
        }
    }

    /// A PAYLOAD(NEXT|COMPLETE) terminal element.
    pub fn payload_next_complete(stream_id: u32, payload: Payload) -> Self {
        Frame {
            stream_id,
            body: FrameBody::Payload {
                follows: false,
                complete: true,
                next: true,
                payload,
            },
        }
    }

    /// A bare PAYLOAD(COMPLETE) terminal.
    pub fn payload_complete(stream_id: u32) -> Self {
        Frame {
            stream_id,
            body: FrameBody::Payload {
                follows: false,
                complete: true,
                next: false,
                payload: Payload::empty(),
            },
        }
    }

    /// A REQUEST_N credit grant.
    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Frame {
            stream_id,
            body: FrameBody::RequestN { n },
        }
    }

    /// A CANCEL frame.
    pub fn cancel(stream_id: u32) -> Self {
        Frame {
            stream_id,
            body: FrameBody::Cancel,
        }
    }

    /// An ERROR frame with a UTF-8 message.
    pub fn error(stream_id: u32, code: ErrorCode, message: &str) -> Self {
        Frame {
            stream_id,
            body: FrameBody::Error {
                code,
                data: Bytes::copy_from_slice(message.as_bytes()),
            },
        }
    }

    /// A KEEPALIVE frame.
    pub fn keepalive(respond: bool, last_received_position: u64, data: Bytes) -> Self {
        Frame {
            stream_id: 0,
            body: FrameBody::Keepalive {
                respond,
                last_received_position,
                data,
            },
        }
    }

    /// A METADATA_PUSH frame.
    pub fn metadata_push(metadata: Bytes) -> Self {
        Frame {
            stream_id: 0,
            body: FrameBody::MetadataPush { metadata },
        }
    }
}

/// Decode one frame from its exact wire bytes (no length prefix).
///
/// Returns `Ok(None)` for frames the protocol says to drop silently: an
/// unknown frame type with IGNORE set, or METADATA_PUSH addressed to a
/// nonzero stream id. Any other irregularity is an error, which callers
/// surface as a connection-level failure.
pub fn decode(mut buf: Bytes) -> Result<Option<Frame>> {
    use bytes::Buf;

    let header = FrameHeader::decode(&buf)?;
    buf.advance(HEADER_SIZE);

    fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
        if buf.len() < n {
            return Err(RSocketError::MalformedFrame(format!(
                "{} needs {} more bytes, got {}",
                what,
                n,
                buf.len()
            )));
        }
        Ok(())
    }

    fn take_payload(buf: &mut Bytes, metadata_flag: bool) -> Result<Payload> {
        let metadata = if metadata_flag {
            need(buf, 3, "metadata length")?;
            let len = buf.get_uint(3) as usize;
            need(buf, len, "metadata")?;
            Some(buf.split_to(len))
        } else {
            None
        };
        Ok(Payload::new(metadata, buf.split_to(buf.len())))
    }

    let frame_type = match header.frame_type() {
        Some(ft) => ft,
        None if header.has(flags::IGNORE) => {
            tracing::trace!(
                frame_type = header.frame_type,
                "Ignoring unknown frame type (IGNORE set)"
            );
            return Ok(None);
        }
        None => {
            return Err(RSocketError::MalformedFrame(format!(
                "unknown frame type 0x{:02X} without IGNORE",
                header.frame_type
            )));
        }
    };

    let metadata_flag = header.has(flags::METADATA);
    let body = match frame_type {
        FrameType::Setup => {
            need(&buf, 12, "SETUP prefix")?;
            let version = (buf.get_u16(), buf.get_u16());
            let keepalive_millis = buf.get_u32();
            let max_lifetime_millis = buf.get_u32();
            let resume_token = if header.has(flags::RESUME_ENABLE) {
                need(&buf, 2, "resume token length")?;
                let len = buf.get_u16() as usize;
                need(&buf, len, "resume token")?;
                Some(buf.split_to(len))
            } else {
                None
            };
            need(&buf, 1, "metadata mime length")?;
            let mm_len = buf.get_u8() as usize;
            need(&buf, mm_len, "metadata mime")?;
            let metadata_mime = String::from_utf8_lossy(&buf.split_to(mm_len)).into_owned();
            need(&buf, 1, "data mime length")?;
            let dm_len = buf.get_u8() as usize;
            need(&buf, dm_len, "data mime")?;
            let data_mime = String::from_utf8_lossy(&buf.split_to(dm_len)).into_owned();
            FrameBody::Setup {
                version,
                keepalive_millis,
                max_lifetime_millis,
                lease: header.has(flags::LEASE),
                resume_token,
                metadata_mime,
                data_mime,
                payload: take_payload(&mut buf, metadata_flag)?,
            }
        }
        FrameType::Lease => {
            need(&buf, 8, "LEASE body")?;
            let ttl_millis = buf.get_u32();
            let number_of_requests = buf.get_u32();
            let metadata = if metadata_flag {
                Some(buf.split_to(buf.len()))
            } else {
                None
            };
            FrameBody::Lease {
                ttl_millis,
                number_of_requests,
                metadata,
            }
        }
        FrameType::Keepalive => {
            need(&buf, 8, "KEEPALIVE body")?;
            FrameBody::Keepalive {
                respond: header.has(flags::RESPOND),
                last_received_position: buf.get_u64(),
                data: buf.split_to(buf.len()),
            }
        }
        FrameType::RequestResponse => FrameBody::RequestResponse {
            follows: header.has(flags::FOLLOWS),
            payload: take_payload(&mut buf, metadata_flag)?,
        },
        FrameType::RequestFnf => FrameBody::RequestFnf {
            follows: header.has(flags::FOLLOWS),
            payload: take_payload(&mut buf, metadata_flag)?,
        },
        FrameType::RequestStream => {
            need(&buf, 4, "REQUEST_STREAM body")?;
            FrameBody::RequestStream {
                follows: header.has(flags::FOLLOWS),
                initial_request_n: validate_request_n(buf.get_u32())?,
                payload: take_payload(&mut buf, metadata_flag)?,
            }
        }
        FrameType::RequestChannel => {
            need(&buf, 4, "REQUEST_CHANNEL body")?;
            FrameBody::RequestChannel {
                follows: header.has(flags::FOLLOWS),
                complete: header.has(flags::COMPLETE),
                initial_request_n: validate_request_n(buf.get_u32())?,
                payload: take_payload(&mut buf, metadata_flag)?,
            }
        }
        FrameType::RequestN => {
            need(&buf, 4, "REQUEST_N body")?;
            FrameBody::RequestN {
                n: validate_request_n(buf.get_u32())?,
            }
        }
        FrameType::Cancel => {
            if !buf.is_empty() {
                return Err(RSocketError::MalformedFrame(
                    "CANCEL frame must have an empty body".to_string(),
                ));
            }
            FrameBody::Cancel
        }
        FrameType::Payload => FrameBody::Payload {
            follows: header.has(flags::FOLLOWS),
            complete: header.has(flags::COMPLETE),
            next: header.has(flags::NEXT),
            payload: take_payload(&mut buf, metadata_flag)?,
        },
        FrameType::Error => {
            need(&buf, 4, "ERROR body")?;
            FrameBody::Error {
                code: ErrorCode::from_value(buf.get_u32()),
                data: buf.split_to(buf.len()),
            }
        }
        FrameType::MetadataPush => {
            if header.stream_id != 0 {
                tracing::warn!(
                    stream_id = header.stream_id,
                    "Dropping METADATA_PUSH with nonzero stream id"
                );
                return Ok(None);
            }
            FrameBody::MetadataPush {
                metadata: buf.split_to(buf.len()),
            }
        }
        FrameType::Resume => {
            need(&buf, 6, "RESUME prefix")?;
            let _version = (buf.get_u16(), buf.get_u16());
            let token_len = buf.get_u16() as usize;
            need(&buf, token_len + 16, "RESUME body")?;
            let token = buf.split_to(token_len);
            FrameBody::Resume {
                token,
                last_received_server_position: buf.get_u64(),
                first_available_client_position: buf.get_u64(),
            }
        }
        FrameType::ResumeOk => {
            need(&buf, 8, "RESUME_OK body")?;
            FrameBody::ResumeOk {
                last_received_client_position: buf.get_u64(),
            }
        }
        FrameType::Reserved | FrameType::Ext => {
            if header.has(flags::IGNORE) {
                tracing::trace!(frame_type = header.frame_type, "Ignoring frame");
                return Ok(None);
            }
            return Err(RSocketError::MalformedFrame(format!(
                "unhandled frame type 0x{:02X} without IGNORE",
                header.frame_type
            )));
        }
    };

    Ok(Some(Frame {
        stream_id: header.stream_id,
        body,
    }))
}
