//! Responder registration: the handlers a peer runs for incoming requests.
//!
//! A [`Responder`] holds one optional boxed async handler per interaction
//! model, registered through the fluent [`ResponderBuilder`]. Models without
//! a handler answer ERROR(APPLICATION_ERROR).
//!
//! # Example
//!
//! ```ignore
//! use rsocket_core::{Responder, Payload};
//!
//! let responder = Responder::builder()
//!     .request_response(|payload| async move {
//!         Ok(Payload::builder().set_data_utf8("pong").build())
//!     })
//!     .request_stream(|_payload, sink| async move {
//!         for word in ["a", "b", "c"] {
//!             sink.next(Payload::builder().set_data_utf8(word).build()).await?;
//!         }
//!         sink.complete().await
//!     })
//!     .build();
//! ```

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::Result;
use crate::payload::Payload;
use crate::reactive::{PayloadStream, ProducerSink};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type FnfHandler = Box<dyn Fn(Payload) -> BoxFuture<'static, ()> + Send + Sync>;
type RequestResponseHandler =
    Box<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload>> + Send + Sync>;
type RequestStreamHandler =
    Box<dyn Fn(Payload, ProducerSink) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type RequestChannelHandler =
    Box<dyn Fn(PayloadStream, ProducerSink) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type MetadataPushHandler = Box<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers for incoming interactions on one peer.
#[derive(Default)]
pub struct Responder {
    pub(crate) fire_and_forget: Option<FnfHandler>,
    pub(crate) request_response: Option<RequestResponseHandler>,
    pub(crate) request_stream: Option<RequestStreamHandler>,
    pub(crate) request_channel: Option<RequestChannelHandler>,
    pub(crate) metadata_push: Option<MetadataPushHandler>,
}

impl Responder {
    /// A responder with no handlers; every request is rejected.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a responder.
    pub fn builder() -> ResponderBuilder {
        ResponderBuilder {
            inner: Responder::default(),
        }
    }
}

/// Fluent builder for [`Responder`].
pub struct ResponderBuilder {
    inner: Responder,
}

impl ResponderBuilder {
    /// Handle REQUEST_FNF payloads.
    pub fn fire_and_forget<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.fire_and_forget = Some(Box::new(move |payload| Box::pin(handler(payload))));
        self
    }

    /// Handle REQUEST_RESPONSE: return the single reply payload.
    pub fn request_response<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.inner.request_response = Some(Box::new(move |payload| Box::pin(handler(payload))));
        self
    }

    /// Handle REQUEST_STREAM: drive the sink.
    ///
    /// Returning `Ok(())` completes the stream if the handler didn't;
    /// returning `Err` fails it with APPLICATION_ERROR.
    pub fn request_stream<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Payload, ProducerSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.request_stream =
            Some(Box::new(move |payload, sink| Box::pin(handler(payload, sink))));
        self
    }

    /// Handle REQUEST_CHANNEL: consume the incoming stream, drive the sink.
    ///
    /// The requester's first payload arrives as the first element of the
    /// incoming stream.
    pub fn request_channel<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PayloadStream, ProducerSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.request_channel =
            Some(Box::new(move |incoming, sink| Box::pin(handler(incoming, sink))));
        self
    }

    /// Handle METADATA_PUSH metadata.
    pub fn metadata_push<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.metadata_push = Some(Box::new(move |metadata| Box::pin(handler(metadata))));
        self
    }

    /// Finish building.
    pub fn build(self) -> Responder {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_has_no_handlers() {
        let responder = Responder::empty();
        assert!(responder.fire_and_forget.is_none());
        assert!(responder.request_response.is_none());
        assert!(responder.request_stream.is_none());
        assert!(responder.request_channel.is_none());
        assert!(responder.metadata_push.is_none());
    }

    #[tokio::test]
    async fn test_registered_request_response_handler_runs() {
        let responder = Responder::builder()
            .request_response(|payload| async move {
                let text = payload.data_utf8().unwrap_or("").to_uppercase();
                Ok(Payload::builder().set_data_utf8(&text).build())
            })
            .build();

        let handler = responder.request_response.as_ref().unwrap();
        let reply = handler(Payload::from("ping")).await.unwrap();
        assert_eq!(reply.data_utf8(), Some("PING"));
    }

    #[tokio::test]
    async fn test_registered_fnf_handler_runs() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        let responder = Responder::builder()
            .fire_and_forget(move |_payload| {
                let seen = seen_clone.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                }
            })
            .build();

        let handler = responder.fire_and_forget.as_ref().unwrap();
        handler(Payload::from("hint")).await;
        assert!(seen.load(Ordering::SeqCst));
    }
}
