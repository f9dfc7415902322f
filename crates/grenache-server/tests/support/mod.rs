//! Shared fixtures for server integration tests.
//!
//! Provides:
//! - Spawning a [`TransportServer`] on an ephemeral port
//! - Buffered clients bound to a spawned server
//! - Raw hyper requests for wire-level assertions
//! - A throwaway PKI built with rcgen

#![allow(dead_code)]

use bytes::Bytes;
use grenache_client::{ConnectionPool, TransportClient};
use grenache_common::transport::{HttpBody, HttpTransport};
use grenache_common::{SecureCredentials, TransportConfig};
use grenache_server::{InboundRequest, InboundStream, RpcHandler, ServerHandle, TransportServer};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::sync::Arc;
use tokio::net::TcpStream;

pub async fn spawn_server<H: RpcHandler>(config: TransportConfig, handler: H) -> ServerHandle {
    TransportServer::bind("127.0.0.1:0", config, handler)
        .await
        .expect("Failed to bind test server")
        .spawn()
        .expect("Failed to spawn test server")
}

pub fn client_for(server: &ServerHandle, timeout_ms: u64) -> TransportClient {
    let config = TransportConfig::for_destination(server.local_addr().to_string()).with_timeout(timeout_ms);
    TransportClient::new(config, Arc::new(ConnectionPool::default())).unwrap()
}

pub fn stream_config(server: &ServerHandle, timeout_ms: u64) -> TransportConfig {
    TransportConfig::for_destination(server.local_addr().to_string()).with_timeout(timeout_ms)
}

/// `POST /` with `body` and the given extra headers.
pub fn post(body: impl Into<Bytes>, headers: &[(&str, &str)]) -> http::Request<HttpBody> {
    let mut builder = http::Request::builder().method("POST").uri("/");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(HttpTransport::full(body.into())).unwrap()
}

/// Sends one request on a fresh connection and reads the whole response.
pub async fn try_raw_request(
    server: &ServerHandle,
    request: http::Request<HttpBody>,
) -> Result<(http::response::Parts, Bytes), hyper::Error> {
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(conn);

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok((parts, body))
}

pub async fn raw_request(
    server: &ServerHandle,
    request: http::Request<HttpBody>,
) -> (http::response::Parts, Bytes) {
    try_raw_request(server, request).await.unwrap()
}

/// Routes streams through `F` and echoes decoded payloads back.
pub struct StreamHandler<F>(pub F);

impl<F> RpcHandler for StreamHandler<F>
where
    F: Fn(InboundStream) -> Option<InboundStream> + Send + Sync + 'static,
{
    fn on_stream(&self, stream: InboundStream) -> Option<InboundStream> {
        (self.0)(stream)
    }

    fn on_request(&self, request: InboundRequest) {
        let InboundRequest { payload, reply, .. } = request;
        reply.reply(Ok(payload));
    }
}

/// PEM key and certificate pair.
#[derive(Clone)]
pub struct Identity {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub der: Vec<u8>,
}

/// A CA with one server and one client certificate issued by it.
pub struct TestPki {
    pub ca: Identity,
    pub server: Identity,
    pub client: Identity,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "grenache test ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let issue = |common_name: &str| {
            let key = KeyPair::generate().unwrap();
            let mut params =
                CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
            params.distinguished_name.push(DnType::CommonName, common_name);
            let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();
            Identity {
                key: key.serialize_pem().into_bytes(),
                cert: cert.pem().into_bytes(),
                der: cert.der().to_vec(),
            }
        };

        let server = issue("grenache test server");
        let client = issue("grenache test client");

        Self {
            ca: Identity {
                key: ca_key.serialize_pem().into_bytes(),
                cert: ca_cert.pem().into_bytes(),
                der: ca_cert.der().to_vec(),
            },
            server,
            client,
        }
    }

    pub fn server_credentials(&self) -> SecureCredentials {
        SecureCredentials::new(self.server.key.clone(), self.server.cert.clone(), self.ca.cert.clone())
    }

    pub fn client_credentials(&self) -> SecureCredentials {
        SecureCredentials::new(self.client.key.clone(), self.client.cert.clone(), self.ca.cert.clone())
    }
}

/// Certificate not issued by any test CA.
pub fn self_signed() -> Identity {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    Identity {
        key: certified.key_pair.serialize_pem().into_bytes(),
        cert: certified.cert.pem().into_bytes(),
        der: certified.cert.der().to_vec(),
    }
}
