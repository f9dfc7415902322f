//! Two-phase dispatch of inbound requests.
//!
//! Every request is first offered to [`RpcHandler::on_stream`] with its body
//! still unread. A handler that wants the raw bytes keeps the
//! [`InboundStream`]; otherwise, unless buffering is disabled, the transport
//! reads the whole body, decodes the `[rid, key, payload]` envelope and
//! calls [`RpcHandler::on_request`], or [`RpcHandler::on_request_error`]
//! when the body cannot be decoded.
//!
//! A `_gr` header that does not parse is answered right away with `500` and
//! `[null,"ERR_HEADER_PARSE_GR",null]`; no handler method runs for it.

use bytes::Bytes;
use grenache_common::compression::maybe_decompress;
use grenache_common::protocol::envelope;
use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::protocol::{Meta, PeerCertificate};
use grenache_common::transport::{HttpTransport, HyperRequest, HyperResponse};
use grenache_common::TransportConfig;
use http::{HeaderMap, Method};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::reply::{Outcome, ReplyHandler, Responder};

/// Application side of a [`TransportServer`](crate::TransportServer).
///
/// Methods run on the connection's task and should not block; hand longer
/// work to a spawned task together with the reply handle.
pub trait RpcHandler: Send + Sync + 'static {
    /// Sees every request before its body is read.
    ///
    /// Return the stream to let the transport buffer and decode it, or
    /// consume it to handle the body yourself.
    fn on_stream(&self, stream: InboundStream) -> Option<InboundStream> {
        Some(stream)
    }

    /// A fully decoded request.
    fn on_request(&self, request: InboundRequest);

    /// A buffered body that could not be decoded.
    ///
    /// The default drops the error, leaving the caller to time out.
    fn on_request_error(&self, error: RequestError) {
        tracing::warn!(
            rid = ?error.rid,
            reason = %error.reason,
            "Dropping undecodable request"
        );
    }
}

/// [`RpcHandler`] that only answers decoded requests.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps a closure as an [`RpcHandler`].
///
/// # Example
///
/// ```rust
/// use grenache_server::handler_fn;
/// use serde_json::json;
///
/// let handler = handler_fn(|request| {
///     request.reply.reply(Ok(json!("world")));
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(InboundRequest) + Send + Sync + 'static,
{
    FnHandler { f }
}

impl<F> RpcHandler for FnHandler<F>
where
    F: Fn(InboundRequest) + Send + Sync + 'static,
{
    fn on_request(&self, request: InboundRequest) {
        (self.f)(request)
    }
}

/// Request whose body has not been read yet.
pub struct InboundStream {
    method: Method,
    headers: HeaderMap,
    body: Incoming,
    meta: Meta,
    responder: Responder,
    max_body_bytes: usize,
}

impl InboundStream {
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Takes the request apart for manual handling.
    pub fn into_parts(self) -> (Meta, InboundBody, Responder) {
        let InboundStream {
            body,
            meta,
            responder,
            ..
        } = self;
        (meta, InboundBody { incoming: body }, responder)
    }

    /// Reads and decodes the body the way buffered dispatch does.
    ///
    /// The `_gr` header, when present, names the request; the body's own rid
    /// and key are used otherwise. A gzip body that fails to inflate is
    /// decoded as-is.
    pub async fn buffer(self) -> std::result::Result<InboundRequest, RequestError> {
        let InboundStream {
            body,
            meta,
            responder,
            max_body_bytes,
            ..
        } = self;

        let raw = match HttpTransport::collect_limited(body, max_body_bytes).await {
            Ok(raw) => raw,
            Err(e) => return Err(RequestError::new(meta, responder, None, e.to_string())),
        };

        let plain = if meta.gzip_body {
            match maybe_decompress(&raw, true) {
                Ok(inflated) => Bytes::from(inflated.into_owned()),
                Err(e) => {
                    tracing::warn!(rid = ?meta.rid(), error = %e, "Failed to inflate request body");
                    raw
                }
            }
        } else {
            raw
        };

        let decoded = match envelope::decode_request(&plain) {
            Ok(decoded) => decoded,
            Err(e) => return Err(RequestError::new(meta, responder, None, e.to_string())),
        };

        let (rid, key) = match (meta.info_headers.clone(), decoded.rid, decoded.key) {
            (Some(named), _, _) => named,
            (None, Some(rid), Some(key)) => (rid, key),
            (None, rid, _) => {
                return Err(RequestError::new(
                    meta,
                    responder,
                    rid,
                    "request envelope carries no rid or key".to_string(),
                ))
            }
        };

        Ok(InboundRequest {
            rid: rid.clone(),
            key,
            payload: decoded.payload,
            meta,
            reply: ReplyHandler::new(rid, responder),
        })
    }
}

/// Raw request body of a manually handled stream.
pub struct InboundBody {
    incoming: Incoming,
}

impl InboundBody {
    /// Next body chunk; `None` at the end of the body.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.incoming.frame().await? {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        return Some(Ok(data));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    /// Reads the rest of the body, failing past `limit` bytes.
    pub async fn read_to_end(self, limit: usize) -> Result<Bytes> {
        HttpTransport::collect_limited(self.incoming, limit).await
    }
}

/// A decoded buffered request.
pub struct InboundRequest {
    pub rid: String,
    pub key: String,
    pub payload: Value,
    pub meta: Meta,
    pub reply: ReplyHandler,
}

impl InboundRequest {
    pub fn peer_certificate(&self) -> Option<&PeerCertificate> {
        self.meta.peer_certificate.as_deref()
    }
}

/// A buffered body that could not be turned into a request.
pub struct RequestError {
    /// Rid taken from `_gr` or from the partially decoded body.
    pub rid: Option<String>,
    pub meta: Meta,
    pub reason: String,
    /// Present whenever a rid is known.
    pub reply: Option<ReplyHandler>,
}

impl RequestError {
    fn new(meta: Meta, responder: Responder, body_rid: Option<String>, reason: String) -> Self {
        let rid = meta.rid().map(str::to_string).or(body_rid);
        let reply = rid
            .clone()
            .map(|rid| ReplyHandler::new(rid, responder));

        Self {
            rid,
            meta,
            reason,
            reply,
        }
    }
}

/// Per-server dispatch settings.
#[derive(Debug, Clone)]
pub(crate) struct DispatchSettings {
    pub disable_buffered: bool,
    pub max_body_bytes: usize,
    pub abandon_after: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            disable_buffered: config.disable_buffered,
            max_body_bytes: config.max_body_bytes,
            abandon_after: config.timeout(),
        }
    }
}

/// Runs one request through the handler and waits for its response.
///
/// An abandoned request holds the connection for `abandon_after` and then
/// fails, which makes hyper close the connection.
pub(crate) async fn dispatch(
    handler: &dyn RpcHandler,
    settings: &DispatchSettings,
    request: HyperRequest,
    peer_certificate: Option<Arc<PeerCertificate>>,
) -> Result<HyperResponse> {
    let (parts, body) = request.into_parts();

    let meta = match Meta::from_headers(&parts.headers, peer_certificate) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting request with malformed _gr header");
            return Ok(HttpTransport::header_parse_failure());
        }
    };

    let rid = meta.rid().map(str::to_string);
    let (responder, outcome) = Responder::new(meta.compress);
    let stream = InboundStream {
        method: parts.method,
        headers: parts.headers,
        body,
        meta,
        responder,
        max_body_bytes: settings.max_body_bytes,
    };

    if let Some(stream) = handler.on_stream(stream) {
        if settings.disable_buffered {
            tracing::debug!(rid = ?rid, "Buffered dispatch disabled, dropping unhandled stream");
            drop(stream);
        } else {
            match stream.buffer().await {
                Ok(request) => handler.on_request(request),
                Err(error) => handler.on_request_error(error),
            }
        }
    }

    match outcome.await {
        Ok(Outcome::Respond(response)) => Ok(response),
        Ok(Outcome::Abandon) | Err(_) => {
            tracing::debug!(
                rid = ?rid,
                timeout_ms = settings.abandon_after.as_millis() as u64,
                "Request abandoned, holding connection until timeout"
            );
            tokio::time::sleep(settings.abandon_after).await;
            Err(GrenacheError::Transport("request abandoned".into()))
        }
    }
}
