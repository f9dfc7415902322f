//! Buffered transport client.
//!
//! Sends one `[rid, key, payload]` envelope per call over a pooled keep-alive
//! connection and resolves with the matching `[rid, errorMessage, result]`
//! reply.
//!
//! # Request Flow
//!
//! 1. Encode the envelope and gzip it when `compress` is set
//! 2. Register the rid in the pending table
//! 3. Spawn the exchange: acquire a pooled connection, `POST /`, read the
//!    whole reply, release the connection, complete the slot named by the
//!    reply's rid
//! 4. Wait on the slot for at most the configured timeout; on expiry abort the
//!    exchange, which drops its connection
//!
//! There is exactly one attempt per call.

use grenache_common::compression::{maybe_compress, maybe_decompress};
use grenache_common::protocol::envelope;
use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::protocol::{Reply, Request, RequestOptions};
use grenache_common::transport::{
    apply_pass_through, header_contains, HttpBody, HttpTransport, HEADER_COMPRESS,
};
use grenache_common::TransportConfig;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Uri};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dial::Dialer;
use crate::pending::PendingRequests;
use crate::pool::ConnectionPool;

/// Buffered request/reply client bound to one destination.
///
/// # Example
///
/// ```rust,no_run
/// use grenache_client::{ConnectionPool, PoolConfig, TransportClient};
/// use grenache_common::{RequestOptions, TransportConfig};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
/// let client = TransportClient::new(TransportConfig::for_destination("127.0.0.1:1337"), pool)?;
///
/// let result = client
///     .request("rpc_test", json!("hello"), &RequestOptions::new().with_compress(true))
///     .await?;
/// println!("{}", result);
/// # Ok(())
/// # }
/// ```
pub struct TransportClient {
    destination: String,
    dialer: Dialer,
    pool: Arc<ConnectionPool>,
    pending: Arc<PendingRequests>,
    timeout: Duration,
}

impl TransportClient {
    /// Creates a client for `config.destination`.
    ///
    /// # Errors
    ///
    /// - [`GrenacheError::Transport`] when the config has no destination
    /// - [`GrenacheError::TlsConfig`] when secure credentials are unusable
    pub fn new(config: TransportConfig, pool: Arc<ConnectionPool>) -> Result<Self> {
        let destination = config
            .destination
            .clone()
            .ok_or_else(|| GrenacheError::Transport("transport client needs a destination".into()))?;
        let dialer = Dialer::from_config(&config)?;

        Ok(Self {
            destination,
            dialer,
            pool,
            pending: Arc::new(PendingRequests::new()),
            timeout: config.timeout(),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Sends `payload` to `key` under a fresh uuid rid and returns the result.
    ///
    /// # Errors
    ///
    /// A reply carrying an error message resolves as [`GrenacheError::Remote`];
    /// see [`send`](Self::send) for transport errors.
    pub async fn request(&self, key: &str, payload: Value, options: &RequestOptions) -> Result<Value> {
        let request = Request::new(Uuid::new_v4().to_string(), key, payload);
        self.send(request, options).await?.into_result()
    }

    /// Performs one buffered exchange.
    ///
    /// # Errors
    ///
    /// - `ERR_REQUEST_ENCODING_COMPRESSION` when the body cannot be compressed
    /// - `ERR_REQUEST_GENERIC` on timeout, connection failure or a non-2xx status
    /// - `ERR_REPLY_ENCODING_COMPRESSION` when a gzip reply cannot be inflated
    /// - `ERR_REPLY_EMPTY` when the reply is empty, undecodable or for an unknown rid
    pub async fn send(&self, request: Request, options: &RequestOptions) -> Result<Reply> {
        let http_request = build_request(&self.destination, &request, options)
            .map_err(GrenacheError::into_request_generic)?;
        let slot = self.pending.insert(&request.rid)?;
        let timeout = options.timeout.unwrap_or(self.timeout);

        let task = tokio::spawn(exchange(
            self.pool.clone(),
            self.dialer.clone(),
            self.destination.clone(),
            self.pending.clone(),
            request.rid.clone(),
            http_request,
        ));
        let mut in_flight = InFlight {
            pending: &self.pending,
            rid: &request.rid,
            task,
            armed: true,
        };

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(outcome)) => {
                in_flight.armed = false;
                outcome
            }
            Ok(Err(_)) => Err(GrenacheError::RequestGeneric(
                "exchange ended without completing the request".into(),
            )),
            Err(_) => {
                tracing::debug!(
                    dest = %self.destination,
                    rid = %request.rid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(GrenacheError::RequestGeneric(format!(
                    "timeout after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

/// Tears down an exchange that did not complete: the slot is removed and
/// the task aborted, which drops its connection instead of pooling it.
struct InFlight<'a> {
    pending: &'a PendingRequests,
    rid: &'a str,
    task: JoinHandle<()>,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(self.rid);
            self.task.abort();
        }
    }
}

fn build_request(destination: &str, request: &Request, options: &RequestOptions) -> Result<http::Request<HttpBody>> {
    let body = envelope::encode_request(&request.rid, &request.key, &request.payload)?;
    let body = maybe_compress(&body, options.compress)
        .map_err(|_| GrenacheError::RequestEncodingCompression)?
        .into_owned();

    let mut http_request = http::Request::new(HttpTransport::full(body));
    *http_request.method_mut() = Method::POST;
    *http_request.uri_mut() = Uri::from_static("/");

    let headers = http_request.headers_mut();
    apply_pass_through(headers, &options.headers)?;
    headers.insert(
        HOST,
        HeaderValue::from_str(destination)
            .map_err(|e| GrenacheError::Transport(format!("invalid destination {}: {}", destination, e)))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if options.compress {
        headers.insert(HEADER_COMPRESS, HeaderValue::from_static("gzip"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    } else {
        headers.insert(HEADER_COMPRESS, HeaderValue::from_static("none"));
    }

    Ok(http_request)
}

async fn exchange(
    pool: Arc<ConnectionPool>,
    dialer: Dialer,
    destination: String,
    pending: Arc<PendingRequests>,
    rid: String,
    request: http::Request<HttpBody>,
) {
    let outcome = perform(&pool, &dialer, &destination, request)
        .await
        .map_err(GrenacheError::into_request_generic);

    match outcome {
        Ok(reply) if reply.rid == rid => {
            pending.complete(&rid, Ok(reply));
        }
        Ok(reply) => {
            tracing::warn!(dest = %destination, rid = %rid, reply_rid = %reply.rid, "Reply rid does not match request");
            let reply_rid = reply.rid.clone();
            pending.complete(&reply_rid, Ok(reply));
            pending.complete(&rid, Err(GrenacheError::ReplyEmpty));
        }
        Err(err) => {
            pending.complete(&rid, Err(err));
        }
    }
}

async fn perform(
    pool: &ConnectionPool,
    dialer: &Dialer,
    destination: &str,
    request: http::Request<HttpBody>,
) -> Result<Reply> {
    let mut conn = pool.acquire(dialer, destination).await?;
    let response = conn.send(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    pool.release(conn);

    if !parts.status.is_success() {
        return Err(GrenacheError::RequestGeneric(format!(
            "{}: {}",
            parts.status,
            String::from_utf8_lossy(&body)
        )));
    }

    let gzip = header_contains(&parts.headers, CONTENT_ENCODING, "gzip");
    let plain = maybe_decompress(&body, gzip).map_err(|_| GrenacheError::ReplyEncodingCompression)?;

    envelope::decode_reply(&plain).map_err(|_| GrenacheError::ReplyEmpty)
}
