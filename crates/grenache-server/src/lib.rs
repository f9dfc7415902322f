//! Grenache Server
//!
//! This crate provides the listening side of the grenache HTTP transport:
//! a hyper-based HTTP/1.1 server, optionally over TLS with client
//! certificates, that hands every request to an [`RpcHandler`] in two
//! phases.
//!
//! 1. [`RpcHandler::on_stream`] sees the request before its body is read
//!    and may take it over for raw streaming
//! 2. Otherwise the body is buffered, decoded as `[rid, key, payload]` and
//!    passed to [`RpcHandler::on_request`]
//!
//! Replies go through a [`ReplyHandler`] or [`Responder`]; each request is
//! answered at most once.

pub mod dispatch;
pub mod http_server;
pub mod reply;

pub use dispatch::{
    handler_fn, FnHandler, InboundBody, InboundRequest, InboundStream, RequestError, RpcHandler,
};
pub use http_server::{ServerHandle, TransportServer};
pub use reply::{ReplyHandler, Responder, ResponseWriter};
