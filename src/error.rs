//! Error types for rsocket-core.

use thiserror::Error;

/// Standard RSocket error codes carried by ERROR frames.
///
/// The numeric values are fixed by the protocol and sent big-endian in the
/// first four bytes of the ERROR frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The SETUP frame is invalid for the server.
    InvalidSetup,
    /// The server does not support the setup parameters.
    UnsupportedSetup,
    /// The server rejected the SETUP.
    RejectedSetup,
    /// The server rejected the resume attempt.
    RejectedResume,
    /// The connection is being terminated because of an error.
    ConnectionError,
    /// The connection is being terminated gracefully.
    ConnectionClose,
    /// Application layer logic generated an error.
    ApplicationError,
    /// The responder rejected the request (e.g. lease exhausted).
    Rejected,
    /// The responder canceled the request.
    Canceled,
    /// The request is invalid.
    Invalid,
    /// Reserved for extension, must never be sent.
    Reserved,
    /// A code outside the table above.
    Other(u32),
}

impl ErrorCode {
    /// Wire value of this code.
    pub fn value(self) -> u32 {
        match self {
            ErrorCode::InvalidSetup => 0x0000_0001,
            ErrorCode::UnsupportedSetup => 0x0000_0002,
            ErrorCode::RejectedSetup => 0x0000_0003,
            ErrorCode::RejectedResume => 0x0000_0004,
            ErrorCode::ConnectionError => 0x0000_0101,
            ErrorCode::ConnectionClose => 0x0000_0102,
            ErrorCode::ApplicationError => 0x0000_0201,
            ErrorCode::Rejected => 0x0000_0202,
            ErrorCode::Canceled => 0x0000_0203,
            ErrorCode::Invalid => 0x0000_0204,
            ErrorCode::Reserved => 0xFFFF_FFFF,
            ErrorCode::Other(v) => v,
        }
    }

    /// Map a wire value back to a code.
    pub fn from_value(value: u32) -> Self {
        match value {
            0x0000_0001 => ErrorCode::InvalidSetup,
            0x0000_0002 => ErrorCode::UnsupportedSetup,
            0x0000_0003 => ErrorCode::RejectedSetup,
            0x0000_0004 => ErrorCode::RejectedResume,
            0x0000_0101 => ErrorCode::ConnectionError,
            0x0000_0102 => ErrorCode::ConnectionClose,
            0x0000_0201 => ErrorCode::ApplicationError,
            0x0000_0202 => ErrorCode::Rejected,
            0x0000_0203 => ErrorCode::Canceled,
            0x0000_0204 => ErrorCode::Invalid,
            0xFFFF_FFFF => ErrorCode::Reserved,
            other => ErrorCode::Other(other),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::InvalidSetup => "INVALID_SETUP",
            ErrorCode::UnsupportedSetup => "UNSUPPORTED_SETUP",
            ErrorCode::RejectedSetup => "REJECTED_SETUP",
            ErrorCode::RejectedResume => "REJECTED_RESUME",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::ConnectionClose => "CONNECTION_CLOSE",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Invalid => "INVALID",
            ErrorCode::Reserved => "RESERVED",
            ErrorCode::Other(v) => return write!(f, "0x{:08X}", v),
        };
        f.write_str(name)
    }
}

/// Main error type for all rsocket-core operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying byte transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame failed to decode or violated its body layout.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A well-formed frame arrived in an illegal place (bad stream id,
    /// duplicate terminal, interleaved fragment chain, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An ERROR frame received from the peer.
    #[error("Remote error: {code}: {message}")]
    Remote {
        /// Wire error code from the frame body.
        code: ErrorCode,
        /// UTF-8 rendering of the frame's error data.
        message: String,
    },

    /// The interaction was canceled, locally or via a CANCEL frame.
    #[error("Canceled")]
    Canceled,

    /// No valid lease covers this request; nothing was sent on the wire.
    #[error("Rejected by lease")]
    RejectedByLease,

    /// No frame arrived within the negotiated max lifetime.
    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    /// The connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// URI scheme or option this build cannot serve (e.g. `tcps`, `wss`).
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl RSocketError {
    /// Build a [`RSocketError::Remote`] from an ERROR frame body.
    pub fn remote(code: ErrorCode, data: &[u8]) -> Self {
        RSocketError::Remote {
            code,
            message: String::from_utf8_lossy(data).into_owned(),
        }
    }
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        let codes = [
            ErrorCode::InvalidSetup,
            ErrorCode::UnsupportedSetup,
            ErrorCode::RejectedSetup,
            ErrorCode::RejectedResume,
            ErrorCode::ConnectionError,
            ErrorCode::ConnectionClose,
            ErrorCode::ApplicationError,
            ErrorCode::Rejected,
            ErrorCode::Canceled,
            ErrorCode::Invalid,
            ErrorCode::Reserved,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_value(code.value()), code);
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let code = ErrorCode::from_value(0x0000_0300);
        assert_eq!(code, ErrorCode::Other(0x0000_0300));
        assert_eq!(code.value(), 0x0000_0300);
        assert_eq!(code.to_string(), "0x00000300");
    }

    #[test]
    fn test_remote_error_message() {
        let err = RSocketError::remote(ErrorCode::ApplicationError, b"boom");
        assert_eq!(err.to_string(), "Remote error: APPLICATION_ERROR: boom");
    }
}
