//! Streaming transport client.
//!
//! A stream is a dedicated HTTP/1.1 connection carrying one chunked request
//! body one way and the response body the other way. Routing data rides in
//! headers, so the body is free for raw bytes:
//!
//! ```text
//! _gr: ["<rid>","<key>"]
//! _a:  <action>            (optional)
//! _ar: {"json":"object"}   (optional)
//! ```
//!
//! Stream connections never come from the keep-alive pool and are closed
//! once the exchange ends. Both halves are backed by bounded channels, so a
//! slow reader on either end pushes back on the writer.

use bytes::Bytes;
use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::protocol::RequestOptions;
use grenache_common::transport::{apply_pass_through, encode_gr, BodySender, HttpBody, HttpTransport, HEADER_GR};
use grenache_common::TransportConfig;
use http::header::{CONNECTION, HOST};
use http::{HeaderValue, Method, Uri};
use http_body_util::BodyExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dial::Dialer;

/// Chunks buffered per direction before the producer waits.
const CHANNEL_CAPACITY: usize = 16;

/// Read size used by [`StreamWriter::write_from`].
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Opens duplex streams to one destination.
#[derive(Clone, Debug)]
pub struct StreamClient {
    destination: String,
    dialer: Dialer,
    timeout: Duration,
}

impl StreamClient {
    /// # Errors
    ///
    /// - [`GrenacheError::Transport`] when the config has no destination
    /// - [`GrenacheError::TlsConfig`] when secure credentials are unusable
    pub fn new(config: TransportConfig) -> Result<Self> {
        let destination = config
            .destination
            .clone()
            .ok_or_else(|| GrenacheError::Transport("stream client needs a destination".into()))?;
        let dialer = Dialer::from_config(&config)?;

        Ok(Self {
            destination,
            dialer,
            timeout: config.timeout(),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Opens a stream to `key` under a fresh uuid rid.
    pub fn open(&self, key: &str, options: &RequestOptions) -> Result<DuplexChannel> {
        self.open_with_rid(&Uuid::new_v4().to_string(), key, options)
    }

    /// Opens a stream to `key` under `rid`.
    ///
    /// Returns immediately; connecting happens in the background and any
    /// failure shows up on the channel's reader. `options.timeout` bounds
    /// connecting and every wait for the next response chunk once the
    /// response has started.
    ///
    /// # Errors
    ///
    /// Only for headers that cannot be encoded.
    pub fn open_with_rid(&self, rid: &str, key: &str, options: &RequestOptions) -> Result<DuplexChannel> {
        let (writer, body) = HttpTransport::channel(CHANNEL_CAPACITY);
        let request = build_stream_request(&self.destination, rid, key, options, body)?;
        let (read_tx, read_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let dialer = self.dialer.clone();
        let destination = self.destination.clone();
        let timeout = options.timeout.unwrap_or(self.timeout);
        let rid_owned = rid.to_string();

        tokio::spawn(async move {
            if let Err(err) = pump(&dialer, &destination, request, &read_tx, timeout).await {
                tracing::debug!(dest = %destination, rid = %rid_owned, error = %err, "Stream failed");
                let _ = read_tx.send(Err(err)).await;
            }
        });

        Ok(DuplexChannel {
            rid: rid.to_string(),
            writer: StreamWriter { sender: writer },
            reader: StreamReader { rx: read_rx },
        })
    }
}

fn build_stream_request(
    destination: &str,
    rid: &str,
    key: &str,
    options: &RequestOptions,
    body: HttpBody,
) -> Result<http::Request<HttpBody>> {
    let mut request = http::Request::new(body);
    *request.method_mut() = Method::POST;
    *request.uri_mut() = Uri::from_static("/");

    let headers = request.headers_mut();
    apply_pass_through(headers, &options.headers)?;
    headers.insert(HEADER_GR, encode_gr(rid, key)?);
    headers.insert(
        HOST,
        HeaderValue::from_str(destination)
            .map_err(|e| GrenacheError::Transport(format!("invalid destination {}: {}", destination, e)))?,
    );
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    Ok(request)
}

async fn pump(
    dialer: &Dialer,
    destination: &str,
    request: http::Request<HttpBody>,
    read_tx: &mpsc::Sender<Result<Bytes>>,
    timeout: Duration,
) -> Result<()> {
    let mut sender = tokio::time::timeout(timeout, dialer.connect(destination))
        .await
        .map_err(|_| GrenacheError::RequestGeneric(format!("connect timeout after {}ms", timeout.as_millis())))??;

    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        tracing::warn!(dest = %destination, status = %response.status(), "Stream answered with error status");
    }

    let mut body = response.into_body();
    loop {
        let frame = match tokio::time::timeout(timeout, body.frame()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Ok(()),
            Err(_) => {
                return Err(GrenacheError::RequestGeneric(format!(
                    "stream idle for {}ms",
                    timeout.as_millis()
                )))
            }
        };

        if let Ok(chunk) = frame.into_data() {
            if read_tx.send(Ok(chunk)).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Full-duplex byte channel returned by [`StreamClient::open`].
///
/// Errors from either direction are reported once, on the reader. Dropping
/// the reader tears down the connection, after which writes fail with
/// [`GrenacheError::StreamClosed`].
pub struct DuplexChannel {
    pub rid: String,
    pub writer: StreamWriter,
    pub reader: StreamReader,
}

impl DuplexChannel {
    pub fn into_split(self) -> (StreamWriter, StreamReader) {
        (self.writer, self.reader)
    }

    /// Writes `body` in full, ends the request and collects the whole response.
    pub async fn exchange(self, body: impl Into<Bytes>) -> Result<Vec<u8>> {
        let (mut writer, reader) = self.into_split();
        let written = writer.write(body.into()).await;
        writer.finish();
        let response = reader.read_to_end().await;
        match (written, response) {
            (_, Err(err)) => Err(err),
            (Err(err), Ok(_)) => Err(err),
            (Ok(()), Ok(bytes)) => Ok(bytes),
        }
    }
}

/// Writable half: becomes the chunked request body.
pub struct StreamWriter {
    sender: BodySender,
}

impl StreamWriter {
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.sender.send(chunk.into()).await
    }

    /// Copies `source` to the stream until EOF, returning the byte count.
    pub async fn write_from<R>(&mut self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = 0u64;
        loop {
            let mut buf = vec![0u8; COPY_CHUNK_SIZE];
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            buf.truncate(n);
            self.sender.send(Bytes::from(buf)).await?;
            total += n as u64;
        }
    }

    /// Ends the request body.
    pub fn finish(self) {}

    /// Aborts the request body so the peer sees a broken transfer.
    pub async fn abort(self, reason: &str) {
        self.sender
            .abort(std::io::Error::new(std::io::ErrorKind::Interrupted, reason.to_string()))
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Readable half: yields the response body.
pub struct StreamReader {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl StreamReader {
    /// Next response chunk; `None` once the response has ended.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}
