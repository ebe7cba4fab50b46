//! Payload type: the `(metadata, data)` pair carried by payload-bearing frames.
//!
//! Uses `bytes::Bytes` for zero-copy sharing. Metadata travels on the wire
//! only when present, signalled by the METADATA flag on the carrying frame.
//!
//! # Example
//!
//! ```
//! use rsocket_core::Payload;
//!
//! let payload = Payload::builder()
//!     .set_data_utf8("ping")
//!     .set_metadata_utf8("hdr")
//!     .build();
//!
//! assert_eq!(payload.data(), b"ping");
//! assert_eq!(payload.metadata().map(|m| &m[..]), Some(&b"hdr"[..]));
//! ```

use bytes::Bytes;

/// A protocol payload: optional metadata plus data bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    metadata: Option<Bytes>,
    data: Bytes,
}

impl Payload {
    /// Create a payload from parts.
    pub fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Self { metadata, data }
    }

    /// Create an empty payload (no metadata, zero-length data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a payload.
    pub fn builder() -> PayloadBuilder {
        PayloadBuilder::default()
    }

    /// Data bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Metadata bytes, if present.
    #[inline]
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Whether metadata is present (drives the METADATA flag on the wire).
    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Data interpreted as UTF-8, if valid.
    pub fn data_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Metadata interpreted as UTF-8, if present and valid.
    pub fn metadata_utf8(&self) -> Option<&str> {
        self.metadata
            .as_deref()
            .and_then(|m| std::str::from_utf8(m).ok())
    }

    /// Split into `(metadata, data)`.
    pub fn split(self) -> (Option<Bytes>, Bytes) {
        (self.metadata, self.data)
    }

    /// Total body bytes this payload contributes to a frame, excluding the
    /// 3-byte metadata length prefix.
    pub(crate) fn body_len(&self) -> usize {
        self.metadata.as_ref().map(|m| m.len()).unwrap_or(0) + self.data.len()
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(None, data)
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::new(None, Bytes::from_static(data.as_bytes()))
    }
}

/// Fluent builder for [`Payload`].
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    metadata: Option<Bytes>,
    data: Bytes,
}

impl PayloadBuilder {
    /// Set raw data bytes.
    pub fn set_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Set data from a UTF-8 string.
    pub fn set_data_utf8(self, data: &str) -> Self {
        self.set_data(Bytes::copy_from_slice(data.as_bytes()))
    }

    /// Set raw metadata bytes.
    pub fn set_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Set metadata from a UTF-8 string.
    pub fn set_metadata_utf8(self, metadata: &str) -> Self {
        self.set_metadata(Bytes::copy_from_slice(metadata.as_bytes()))
    }

    /// Finish building.
    pub fn build(self) -> Payload {
        Payload {
            metadata: self.metadata,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let p = Payload::builder()
            .set_data_utf8("hello")
            .set_metadata_utf8("meta")
            .build();
        assert_eq!(p.data_utf8(), Some("hello"));
        assert_eq!(p.metadata_utf8(), Some("meta"));
        assert!(p.has_metadata());
    }

    #[test]
    fn test_empty() {
        let p = Payload::empty();
        assert!(p.data().is_empty());
        assert!(!p.has_metadata());
        assert_eq!(p.body_len(), 0);
    }

    #[test]
    fn test_body_len_counts_metadata_and_data() {
        let p = Payload::new(
            Some(Bytes::from_static(b"abc")),
            Bytes::from_static(b"defg"),
        );
        assert_eq!(p.body_len(), 7);
    }

    #[test]
    fn test_from_bytes_has_no_metadata() {
        let p = Payload::from(Bytes::from_static(b"raw"));
        assert!(!p.has_metadata());
        assert_eq!(p.data(), b"raw");
    }

    #[test]
    fn test_split() {
        let p = Payload::builder()
            .set_data_utf8("d")
            .set_metadata_utf8("m")
            .build();
        let (meta, data) = p.split();
        assert_eq!(meta.as_deref(), Some(&b"m"[..]));
        assert_eq!(&data[..], b"d");
    }
}
