//! Grenache HTTP transport clients.
//!
//! - [`TransportClient`]: buffered request/reply over a keep-alive [`ConnectionPool`]
//! - [`StreamClient`]: full-duplex byte streams with header-borne routing
//! - [`PeerRpcClient`]: key-based requests through a discovery [`Link`]

pub mod client;
pub mod dial;
pub mod peer;
pub mod pending;
pub mod pool;
pub mod stream;

pub use client::TransportClient;
pub use dial::Dialer;
pub use peer::{Link, PeerConfig, PeerRpcClient, StaticLink};
pub use pending::PendingRequests;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use stream::{DuplexChannel, StreamClient, StreamReader, StreamWriter};
