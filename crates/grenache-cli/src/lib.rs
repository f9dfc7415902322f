//! # Grenache CLI
//!
//! Command-line tooling for grenache HTTP peers.
//!
//! - `grenache serve`: run an echo peer, optionally over TLS
//! - `grenache call`: send one buffered request and print the JSON result
//! - `grenache stream`: upload a file or stdin over a stream and print the
//!   raw response
//!
//! The binary only parses arguments; the work happens in the functions of
//! this crate so they can be driven from tests.

use anyhow::{anyhow, bail, Context, Result};
use grenache_client::{ConnectionPool, StreamClient, TransportClient};
use grenache_common::{RequestOptions, SecureCredentials, TransportConfig};
use grenache_server::{InboundRequest, InboundStream, RpcHandler, TransportServer};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// TLS material given on the command line.
#[derive(Debug, Default, Clone)]
pub struct TlsPaths<'a> {
    pub key: Option<&'a Path>,
    pub cert: Option<&'a Path>,
    pub ca: Option<&'a Path>,
    pub allow_unauthorized: bool,
    pub request_cert: bool,
}

/// Reads TLS credentials from disk.
///
/// # Returns
///
/// `None` when no TLS flag was given
///
/// # Errors
///
/// Fails when only some of key, cert and ca are given, or a file cannot be
/// read.
pub fn load_credentials(paths: &TlsPaths<'_>) -> Result<Option<SecureCredentials>> {
    let (key, cert, ca) = match (paths.key, paths.cert, paths.ca) {
        (None, None, None) => return Ok(None),
        (Some(key), Some(cert), Some(ca)) => (key, cert, ca),
        _ => bail!("--key, --cert and --ca must be given together"),
    };

    let read = |path: &Path| std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()));

    let creds = SecureCredentials::new(read(key)?, read(cert)?, read(ca)?)
        .reject_unauthorized(!paths.allow_unauthorized)
        .request_cert(paths.request_cert);
    Ok(Some(creds))
}

/// Parses a `name=value` header flag.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_string(), value.to_string())),
        _ => Err(anyhow!("Invalid header '{}': expected name=value", raw)),
    }
}

/// Builds request options from CLI flags.
pub fn request_options(timeout_ms: u64, compress: bool, headers: &[String]) -> Result<RequestOptions> {
    let mut options = RequestOptions::new()
        .with_timeout(timeout_ms)
        .with_compress(compress);
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        options = options.with_header(name, value);
    }
    Ok(options)
}

/// Handler used by `grenache serve`: answers every request with its payload.
///
/// With `manual_buffer` set the handler buffers streams itself, which keeps
/// it working on a server started with buffered dispatch disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler {
    manual_buffer: bool,
}

impl EchoHandler {
    pub fn new(manual_buffer: bool) -> Self {
        Self { manual_buffer }
    }
}

fn echo(request: InboundRequest) {
    tracing::debug!(
        rid = %request.rid,
        key = %request.key,
        peer = ?request.peer_certificate().map(|cert| cert.fingerprint.as_str()),
        "Echoing request"
    );
    let InboundRequest { payload, reply, .. } = request;
    reply.reply(Ok(payload));
}

impl RpcHandler for EchoHandler {
    fn on_stream(&self, stream: InboundStream) -> Option<InboundStream> {
        if !self.manual_buffer {
            return Some(stream);
        }

        tokio::spawn(async move {
            match stream.buffer().await {
                Ok(request) => echo(request),
                Err(error) => {
                    tracing::warn!(rid = ?error.rid, reason = %error.reason, "Failed to buffer stream");
                    if let Some(reply) = error.reply {
                        reply.reply(Err(error.reason));
                    }
                }
            }
        });
        None
    }

    fn on_request(&self, request: InboundRequest) {
        echo(request)
    }
}

/// Runs an echo peer on `bind` until the process exits.
pub async fn serve(bind: &str, config: TransportConfig) -> Result<()> {
    let handler = EchoHandler::new(config.disable_buffered);
    let server = TransportServer::bind(bind, config, handler)
        .await
        .with_context(|| format!("Failed to start server on {}", bind))?;
    server.run().await?;
    Ok(())
}

/// Sends one buffered request and returns the result.
pub async fn call(config: TransportConfig, key: &str, payload: Value, options: &RequestOptions) -> Result<Value> {
    let client = TransportClient::new(config, Arc::new(ConnectionPool::default()))?;
    Ok(client.request(key, payload, options).await?)
}

/// Streams `source` to `key` and writes the response body to `sink`.
///
/// Returns the number of bytes uploaded.
pub async fn stream<R, W>(
    config: TransportConfig,
    key: &str,
    options: &RequestOptions,
    source: &mut R,
    sink: &mut W,
) -> Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let channel = StreamClient::new(config)?.open(key, options)?;
    let (mut writer, mut reader) = channel.into_split();

    let upload = async {
        let sent = writer.write_from(source).await;
        writer.finish();
        sent
    };
    let download = async {
        while let Some(chunk) = reader.next_chunk().await {
            sink.write_all(&chunk?).await?;
        }
        sink.flush().await?;
        Ok::<_, anyhow::Error>(())
    };

    let (sent, received) = tokio::join!(upload, download);
    received?;
    Ok(sent?)
}
