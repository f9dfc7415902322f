//! HTTP/HTTPS listener for grenache peers.
//!
//! The server accepts HTTP/1.1 connections, optionally over TLS, and runs
//! every request through the two-phase dispatch in [`crate::dispatch`].
//!
//! # Architecture
//!
//! The server:
//! - Binds a TCP listener and builds the TLS acceptor up front, so bad
//!   credentials fail at bind time
//! - Spawns a tokio task per connection and performs the TLS handshake there
//! - Captures the client certificate once per connection and attaches it to
//!   every request's [`Meta`](grenache_common::Meta)
//! - Serves keep-alive connections with hyper's HTTP/1.1 server
//!
//! # Example
//!
//! ```no_run
//! use grenache_server::{handler_fn, TransportServer};
//! use grenache_common::TransportConfig;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let handler = handler_fn(|request| request.reply.reply(Ok(json!("world"))));
//!     let server = TransportServer::bind("127.0.0.1:1337", TransportConfig::new(), handler)
//!         .await
//!         .unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::protocol::PeerCertificate;
use grenache_common::tls::build_server_context;
use grenache_common::TransportConfig;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::dispatch::{dispatch, DispatchSettings, RpcHandler};

struct Shared {
    handler: Arc<dyn RpcHandler>,
    settings: DispatchSettings,
}

/// A bound grenache transport server.
pub struct TransportServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
}

impl TransportServer {
    /// Binds to `addr` and prepares TLS when `config.secure` is set.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to listen on; port 0 picks a free port
    /// * `config` - Credentials, timeout, body limit and buffering switch
    /// * `handler` - Receives every request
    ///
    /// # Returns
    ///
    /// The bound server, not yet accepting connections
    ///
    /// # Errors
    ///
    /// - [`GrenacheError::TlsConfig`] when the credentials are unusable
    /// - [`GrenacheError::Transport`] when the address cannot be bound
    pub async fn bind<A, H>(addr: A, config: TransportConfig, handler: H) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: RpcHandler,
    {
        let acceptor = match &config.secure {
            Some(creds) => Some(build_server_context(creds)?.acceptor()),
            None => None,
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GrenacheError::Transport(format!("Failed to bind: {}", e)))?;

        Ok(Self {
            listener,
            acceptor,
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                settings: DispatchSettings::from_config(&config),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| GrenacheError::Transport(format!("Failed to get local address: {}", e)))
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        self.serve(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Stopping only closes the listener; connections already accepted keep
    /// being served until they end.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        tracing::info!(
            addr = %addr,
            secure = self.acceptor.is_some(),
            "Transport server listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_connection(stream, remote),
                    Err(e) => tracing::error!("Failed to accept connection: {}", e),
                },
                _ = &mut shutdown => {
                    tracing::info!(addr = %addr, "Transport server stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = self.serve(shutdown).await {
                tracing::error!("Transport server failed: {}", e);
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    fn spawn_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let shared = self.shared.clone();
        let acceptor = self.acceptor.clone();

        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            match acceptor {
                None => serve_connection(stream, None, shared, remote).await,
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => {
                        let peer_certificate = tls
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|chain| chain.first())
                            .map(|cert| Arc::new(PeerCertificate::from_der(cert.as_ref())));
                        serve_connection(tls, peer_certificate, shared, remote).await
                    }
                    Err(e) => {
                        tracing::debug!(remote = %remote, error = %e, "TLS handshake failed");
                    }
                },
            }
        });
    }
}

async fn serve_connection<S>(
    stream: S,
    peer_certificate: Option<Arc<PeerCertificate>>,
    shared: Arc<Shared>,
    remote: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let shared = shared.clone();
        let peer_certificate = peer_certificate.clone();
        async move { dispatch(shared.handler.as_ref(), &shared.settings, req, peer_certificate).await }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(remote = %remote, error = %err, "Connection closed with error");
    }
}

/// Handle to a server started with [`TransportServer::spawn`].
///
/// Dropping the handle stops the listener.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops the listener and waits for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
