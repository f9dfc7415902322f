//! Grenache Common Types and Transport
//!
//! This crate provides the wire protocol shared by the grenache HTTP
//! transport clients and server.
//!
//! # Overview
//!
//! Peers exchange request/reply pairs and full-duplex byte streams over
//! HTTP(S). This crate contains everything both sides agree on:
//!
//! - **Protocol Layer**: envelopes, request/reply types, request metadata, errors
//! - **Compression**: per-message gzip negotiation
//! - **TLS**: client and server contexts built from raw key/cert/CA material
//! - **Transport Layer**: header names and HTTP body helpers
//!
//! # Architecture
//!
//! - **Transport**: HTTP/1.1 `POST /`, keep-alive for buffered requests,
//!   dedicated chunked connections for streams
//! - **Serialization**: JSON arrays, `[rid, key, payload]` out and
//!   `[rid, errorMessage, result]` back
//! - **Correlation**: the caller-assigned `rid` only
//!
//! # Example
//!
//! ```
//! use grenache_common::protocol::envelope;
//! use serde_json::json;
//!
//! let body = envelope::encode_request("rid-1", "rpc_test", &json!("hello")).unwrap();
//! let decoded = envelope::decode_request(&body).unwrap();
//! assert_eq!(decoded.payload, json!("hello"));
//! ```

pub mod compression;
pub mod config;
pub mod protocol;
pub mod tls;
pub mod transport;

pub use config::TransportConfig;
pub use protocol::*;
pub use tls::{ClientTlsContext, SecureCredentials, ServerTlsContext};
