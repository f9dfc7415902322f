//! Per-request metadata recovered from HTTP headers on the server side.
//!
//! A [`Meta`] is built once the request head has been read, before any body
//! bytes are consumed, so streaming handlers can route on it.

use http::HeaderMap;
use serde_json::{Map, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::error::{GrenacheError, Result};
use crate::transport::headers::{
    header_contains, HEADER_ACTION, HEADER_ARGS, HEADER_COMPRESS, HEADER_GR,
};

/// Certificate the remote peer presented during the TLS handshake.
///
/// Captured once per connection and shared by every request on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// DER encoding of the end-entity certificate.
    pub der: Vec<u8>,
    /// SHA-1 over the DER bytes, uppercase hex pairs joined by `:`.
    pub fingerprint: String,
    /// SHA-256 over the DER bytes, same format.
    pub fingerprint256: String,
}

impl PeerCertificate {
    pub fn from_der(der: &[u8]) -> Self {
        PeerCertificate {
            der: der.to_vec(),
            fingerprint: colon_hex(&Sha1::digest(der)),
            fingerprint256: colon_hex(&Sha256::digest(der)),
        }
    }
}

fn colon_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Routing and negotiation data for one inbound request.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub peer_certificate: Option<Arc<PeerCertificate>>,
    /// Request body is sent with chunked transfer encoding.
    pub is_stream: bool,
    /// The caller accepts a gzip reply.
    pub compress: bool,
    /// The request body itself is gzip encoded.
    pub gzip_body: bool,
    /// `(rid, key)` from the `_gr` header.
    pub info_headers: Option<(String, String)>,
    /// `_a` header.
    pub action: Option<String>,
    /// `_ar` header; an empty object when absent or malformed.
    pub args: Value,
}

impl Meta {
    /// Reads transfer, compression and routing headers.
    ///
    /// # Errors
    ///
    /// Returns [`GrenacheError::HeaderParseGr`] when `_gr` is present but is not
    /// a JSON array opening with two strings; trailing slots are ignored. A
    /// malformed `_ar` never fails; it degrades to an empty object.
    pub fn from_headers(
        headers: &HeaderMap,
        peer_certificate: Option<Arc<PeerCertificate>>,
    ) -> Result<Self> {
        let is_stream = header_contains(headers, http::header::TRANSFER_ENCODING, "chunked");
        let compress = header_contains(headers, http::header::ACCEPT_ENCODING, "gzip");
        let gzip_body = header_contains(headers, HEADER_COMPRESS, "gzip")
            || header_contains(headers, http::header::CONTENT_ENCODING, "gzip");

        let info_headers = match headers.get(HEADER_GR) {
            None => None,
            Some(raw) => Some(parse_gr(raw.as_bytes())?),
        };

        let action = headers
            .get(HEADER_ACTION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let args = headers
            .get(HEADER_ARGS)
            .and_then(|v| serde_json::from_slice::<Value>(v.as_bytes()).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Meta {
            peer_certificate,
            is_stream,
            compress,
            gzip_body,
            info_headers,
            action,
            args,
        })
    }

    pub fn rid(&self) -> Option<&str> {
        self.info_headers.as_ref().map(|(rid, _)| rid.as_str())
    }

    pub fn key(&self) -> Option<&str> {
        self.info_headers.as_ref().map(|(_, key)| key.as_str())
    }
}

fn parse_gr(raw: &[u8]) -> Result<(String, String)> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Array(slots)) => match slots.as_slice() {
            [Value::String(rid), Value::String(key), ..] => Ok((rid.clone(), key.clone())),
            _ => Err(GrenacheError::HeaderParseGr),
        },
        _ => Err(GrenacheError::HeaderParseGr),
    }
}
