//! HTTP Transport Utilities
//!
//! This module provides the body types and envelope/HTTP conversions shared by
//! the transport clients and the transport server.
//!
//! # Components
//!
//! - **[`HttpBody`]**: the one body type used for every outgoing request and response
//! - **[`ChannelBody`]** / **[`BodySender`]**: a bounded channel exposed as a
//!   streaming body; the sender side waits when the peer stops reading
//! - **[`HttpTransport`]**: conversion helpers between envelopes and HTTP messages
//!
//! # Example
//!
//! ```no_run
//! use grenache_common::transport::http::HttpTransport;
//! use serde_json::json;
//!
//! let response = HttpTransport::reply_response("rid-1", None, &json!("world"), false);
//! assert_eq!(response.status(), 200);
//! ```

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Frame, Incoming};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::compression::maybe_compress;
use crate::protocol::envelope;
use crate::protocol::error::{GrenacheError, Result};

/// Body of every message this crate family writes.
pub type HttpBody = UnsyncBoxBody<Bytes, io::Error>;

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for responses written by the server
pub type HyperResponse = Response<HttpBody>;

/// Literal body of the `_gr` parse failure response.
pub const HEADER_PARSE_FAILURE_BODY: &[u8] = br#"[null,"ERR_HEADER_PARSE_GR",null]"#;

/// Streaming body fed by a bounded channel.
///
/// The body has no known length, so hyper writes it with chunked transfer
/// encoding. It ends when every [`BodySender`] is dropped.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, io::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Writing half of a [`ChannelBody`].
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl BodySender {
    /// Queues one chunk, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// [`GrenacheError::StreamClosed`] once the body has been dropped, which
    /// happens when the connection carrying it goes away.
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| GrenacheError::StreamClosed)
    }

    /// Terminates the body with an error so the peer sees a broken transfer
    /// instead of a clean end.
    pub async fn abort(self, error: io::Error) {
        let _ = self.tx.send(Err(error)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    pub fn full(bytes: impl Into<Bytes>) -> HttpBody {
        Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
    }

    pub fn empty() -> HttpBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
    }

    /// Creates a streaming body backed by a channel holding up to `capacity` chunks.
    pub fn channel(capacity: usize) -> (BodySender, HttpBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (BodySender { tx }, ChannelBody { rx }.boxed_unsync())
    }

    /// Builds the response carrying a reply envelope.
    ///
    /// # Arguments
    ///
    /// * `rid` - Request id being answered
    /// * `error` - Error message, if the handler failed
    /// * `result` - Result value
    /// * `compress` - Whether the caller advertised `accept-encoding: gzip`
    ///
    /// # Returns
    ///
    /// A `200 OK` response. When compression fails the body is sent
    /// uncompressed; a reply is never dropped because of compression.
    pub fn reply_response(
        rid: &str,
        error: Option<&str>,
        result: &serde_json::Value,
        compress: bool,
    ) -> HyperResponse {
        let body = match envelope::encode_reply(rid, error, result) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(rid = %rid, error = %e, "Failed to encode reply envelope");
                return Self::status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let (body, gzip) = match maybe_compress(&body, compress) {
            Ok(packed) => (packed.into_owned(), compress),
            Err(e) => {
                tracing::warn!(rid = %rid, error = %e, "Reply compression failed, sending plain body");
                (body, false)
            }
        };

        let mut response = Response::new(Self::full(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if gzip {
            response
                .headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        response
    }

    /// `500` with body `[null,"ERR_HEADER_PARSE_GR",null]`.
    pub fn header_parse_failure() -> HyperResponse {
        let mut response = Response::new(Self::full(Bytes::from_static(HEADER_PARSE_FAILURE_BODY)));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    pub fn status_response(status: StatusCode) -> HyperResponse {
        let mut response = Response::new(Self::empty());
        *response.status_mut() = status;
        response
    }

    /// Reads a whole body into memory, failing once it exceeds `limit` bytes.
    pub async fn collect_limited<B>(body: B, limit: usize) -> Result<Bytes>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Limited::new(body, limit)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| GrenacheError::Transport(format!("failed to read body: {}", e)))
    }
}
