//! Grenache Request Types
//!
//! A request is the `(rid, key, payload)` triple a peer sends to a service,
//! plus the per-call [`RequestOptions`] that shape how the transport delivers it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Caller-assigned correlation token, opaque to the transport.
pub type RequestId = String;
/// Service key the request is routed to.
pub type ServiceKey = String;
/// Arbitrary JSON payload.
pub type Payload = Value;

/// A buffered RPC request.
///
/// # Fields
///
/// - `rid`: unique per logical call; the only correlation token
/// - `key`: service name the destination announced
/// - `payload`: arbitrary JSON value handed to the remote handler
///
/// # Example
///
/// ```
/// use grenache_common::protocol::Request;
/// use serde_json::json;
///
/// let request = Request::new("rid-1", "rpc_test", json!("hello"));
/// assert_eq!(request.key, "rpc_test");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub rid: RequestId,
    pub key: ServiceKey,
    pub payload: Payload,
}

impl Request {
    pub fn new(rid: impl Into<String>, key: impl Into<String>, payload: Payload) -> Self {
        Request {
            rid: rid.into(),
            key: key.into(),
            payload,
        }
    }
}

/// Per-call delivery options.
///
/// `headers` are forwarded verbatim as HTTP headers; string values are sent
/// as-is and any other JSON value is JSON-encoded first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Overrides the client's configured timeout for this call.
    pub timeout: Option<Duration>,
    /// Gzip the request body and ask for a gzip reply.
    pub compress: bool,
    pub headers: BTreeMap<String, Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(Duration::from_millis(timeout_ms));
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
