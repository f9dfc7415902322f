//! Header names and helpers shared by the clients and the server.

use http::header::{AsHeaderName, HeaderName, HeaderValue};
use http::HeaderMap;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::protocol::error::{GrenacheError, Result};

/// `json([rid, key])` on streaming requests.
pub const HEADER_GR: &str = "_gr";
/// Optional action name on streaming requests.
pub const HEADER_ACTION: &str = "_a";
/// Optional JSON object of action arguments on streaming requests.
pub const HEADER_ARGS: &str = "_ar";
/// `gzip` or `none`: encoding of a buffered request body.
pub const HEADER_COMPRESS: &str = "grc-compress";

/// True when any comma-separated token of `name` equals `token`,
/// ignoring case and parameters such as `;q=0.5`.
pub fn header_contains<K: AsHeaderName>(headers: &HeaderMap, name: K, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|item| item.split(';').next().unwrap_or("").trim())
        .any(|item| item.eq_ignore_ascii_case(token))
}

/// Copies caller supplied headers onto an outgoing request.
///
/// String values are sent as-is; every other JSON value is JSON-encoded.
///
/// # Errors
///
/// Returns [`GrenacheError::Transport`] when a name or value is not a legal
/// HTTP header.
pub fn apply_pass_through(headers: &mut HeaderMap, extra: &BTreeMap<String, Value>) -> Result<()> {
    for (name, value) in extra {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GrenacheError::Transport(format!("invalid header name {}: {}", name, e)))?;

        let encoded = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        let header_value = HeaderValue::from_str(&encoded)
            .map_err(|e| GrenacheError::Transport(format!("invalid value for header {}: {}", name, e)))?;

        headers.insert(header_name, header_value);
    }

    Ok(())
}

/// Encodes the `_gr` routing header value.
pub fn encode_gr(rid: &str, key: &str) -> Result<HeaderValue> {
    let raw = serde_json::to_string(&(rid, key))?;
    HeaderValue::from_str(&raw)
        .map_err(|e| GrenacheError::Transport(format!("invalid {} header: {}", HEADER_GR, e)))
}
