//! Connection establishment for plain and TLS destinations.

use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::tls::{build_client_context, server_name, ClientTlsContext};
use grenache_common::transport::HttpBody;
use grenache_common::TransportConfig;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// How connections to a destination are opened.
///
/// Chosen once from [`TransportConfig`]; the TLS context is built at that
/// point so bad credentials fail before any socket is opened.
#[derive(Clone, Debug)]
pub enum Dialer {
    Plain,
    Secure(ClientTlsContext),
}

impl Dialer {
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        match &config.secure {
            None => Ok(Dialer::Plain),
            Some(creds) => Ok(Dialer::Secure(build_client_context(creds)?)),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Dialer::Plain => "http",
            Dialer::Secure(_) => "https",
        }
    }

    /// Opens a new HTTP/1.1 connection to `destination` (`host:port`).
    ///
    /// The connection driver runs on its own task and ends when the returned
    /// sender and every in-flight response are dropped.
    pub async fn connect(&self, destination: &str) -> Result<SendRequest<HttpBody>> {
        let tcp = TcpStream::connect(destination).await.map_err(|e| {
            GrenacheError::RequestGeneric(format!("connect {}: {}", destination, e))
        })?;
        tcp.set_nodelay(true)?;

        match self {
            Dialer::Plain => handshake(tcp, destination).await,
            Dialer::Secure(context) => {
                let name = server_name(destination)?;
                let tls = context.connector().connect(name, tcp).await.map_err(|e| {
                    GrenacheError::RequestGeneric(format!("tls handshake with {}: {}", destination, e))
                })?;
                handshake(tls, destination).await
            }
        }
    }
}

async fn handshake<S>(stream: S, destination: &str) -> Result<SendRequest<HttpBody>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;

    let destination = destination.to_string();
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(dest = %destination, error = %err, "Connection closed with error");
        }
    });

    Ok(sender)
}
