//! Grenache Transport Layer
//!
//! Shared HTTP plumbing for the transport clients and server.
//!
//! # Wire Format
//!
//! - **Buffered**: `POST /` with a JSON envelope body, optionally gzip encoded
//!   (`grc-compress: gzip`)
//! - **Streaming**: `POST /` with a chunked body of raw bytes; routing data
//!   rides in the `_gr`, `_a` and `_ar` headers
//!
//! # Components
//!
//! - [`headers`]: header names, token matching, pass-through header encoding
//! - [`http`]: body types and envelope/HTTP conversions

pub mod headers;
pub mod http;

pub use self::headers::{
    apply_pass_through, encode_gr, header_contains, HEADER_ACTION, HEADER_ARGS, HEADER_COMPRESS,
    HEADER_GR,
};
pub use self::http::{BodySender, ChannelBody, HttpBody, HttpTransport, HyperRequest, HyperResponse};
