//! Envelope Codec
//!
//! Buffered messages travel as JSON arrays:
//!
//! ```text
//! request: [rid, key, payload]
//! reply:   [rid, errorMessage | null, result]
//! ```
//!
//! Decoding never panics. Empty, truncated or non-JSON input, and the JSON
//! literal `null`, all yield [`DecodeFailure`]; callers turn that into an empty
//! reply on the client side and a dropped request on the server side.

use serde_json::Value;
use std::fmt;

use super::error::Result;
use super::responses::Reply;

/// Input bytes were not a usable envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeFailure;

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("undecodable envelope")
    }
}

impl std::error::Error for DecodeFailure {}

/// Request fields recovered from a body.
///
/// Any slot may be missing or of the wrong type; streaming requests are
/// allowed to carry their rid and key in headers instead.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub rid: Option<String>,
    pub key: Option<String>,
    pub payload: Value,
}

pub fn encode_request(rid: &str, key: &str, payload: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&(rid, key, payload))?)
}

pub fn encode_reply(rid: &str, error: Option<&str>, result: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&(rid, error, result))?)
}

/// Parses raw bytes into a JSON value.
pub fn decode(bytes: &[u8]) -> std::result::Result<Value, DecodeFailure> {
    if bytes.is_empty() {
        return Err(DecodeFailure);
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Null) | Err(_) => Err(DecodeFailure),
        Ok(value) => Ok(value),
    }
}

/// Decodes a `[rid, key, payload]` body. The top-level value must be an array.
pub fn decode_request(bytes: &[u8]) -> std::result::Result<RequestEnvelope, DecodeFailure> {
    let value = decode(bytes)?;
    let Value::Array(mut slots) = value else {
        return Err(DecodeFailure);
    };

    slots.resize(3, Value::Null);
    let payload = slots.pop().unwrap_or(Value::Null);
    let key = slots.pop().and_then(string_slot);
    let rid = slots.pop().and_then(string_slot);

    Ok(RequestEnvelope { rid, key, payload })
}

/// Decodes a `[rid, errorMessage, result]` body.
///
/// A reply without a string rid cannot be correlated and is a failure.
pub fn decode_reply(bytes: &[u8]) -> std::result::Result<Reply, DecodeFailure> {
    let value = decode(bytes)?;
    let Value::Array(mut slots) = value else {
        return Err(DecodeFailure);
    };

    slots.resize(3, Value::Null);
    let result = slots.pop().unwrap_or(Value::Null);
    let error = slots.pop().and_then(error_slot);
    let rid = slots.pop().and_then(string_slot).ok_or(DecodeFailure)?;

    Ok(Reply { rid, error, result })
}

/// Only a truthy error slot marks a failed reply.
fn error_slot(value: Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) if message.is_empty() => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(message) => Some(message),
        other => Some(other.to_string()),
    }
}

fn string_slot(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}
