//! HTTP Server Integration Tests
//!
//! Tests cover:
//! - Buffered request/reply with and without gzip
//! - `_gr` header parsing and the early 500 reply
//! - Stream takeover, manual buffering and streamed responses
//! - Out-of-order replies on concurrent requests
//! - Undecodable bodies and the request-error path

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use grenache_client::StreamClient;
use grenache_common::protocol::envelope;
use grenache_common::protocol::error::GrenacheError;
use grenache_common::{RequestOptions, TransportConfig};
use grenache_server::{handler_fn, InboundRequest, InboundStream, RequestError, RpcHandler};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod support;
use support::{client_for, post, raw_request, spawn_server, stream_config, try_raw_request, StreamHandler};

fn hello_world() -> impl RpcHandler {
    handler_fn(|request| {
        let result = if request.key == "rpc_test" && request.payload == json!("hello") {
            Ok(json!("world"))
        } else {
            Err(format!("unexpected {} {}", request.key, request.payload))
        };
        request.reply.reply(result);
    })
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
    out
}

// ============================================================================
// Buffered Requests
// ============================================================================

#[tokio::test]
async fn test_request_reply() {
    let server = spawn_server(TransportConfig::new(), hello_world()).await;
    let client = client_for(&server, 2_000);

    let result = client
        .request("rpc_test", json!("hello"), &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(result, json!("world"));
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    let server = spawn_server(TransportConfig::new(), hello_world()).await;
    let client = client_for(&server, 2_000);

    let result = client
        .request("rpc_test", json!("bye"), &RequestOptions::new())
        .await;
    assert!(matches!(result, Err(GrenacheError::Remote(ref msg)) if msg.starts_with("unexpected")));
}

#[tokio::test]
async fn test_compressed_request_reply() {
    let server = spawn_server(TransportConfig::new(), hello_world()).await;
    let client = client_for(&server, 2_000);

    let result = client
        .request("rpc_test", json!("hello"), &RequestOptions::new().with_compress(true))
        .await
        .unwrap();
    assert_eq!(result, json!("world"));
}

#[tokio::test]
async fn test_gzip_reply_on_the_wire() {
    let server = spawn_server(TransportConfig::new(), hello_world()).await;
    let body = gzip(br#"["rid-gz","rpc_test","hello"]"#);

    let request = post(
        body,
        &[("grc-compress", "gzip"), ("accept-encoding", "gzip"), ("content-type", "application/json")],
    );
    let (parts, body) = raw_request(&server, request).await;

    assert_eq!(parts.status, 200);
    assert_eq!(parts.headers["content-encoding"], "gzip");
    assert_eq!(gunzip(&body), br#"["rid-gz",null,"world"]"#.to_vec());
}

#[tokio::test]
async fn test_plain_reply_without_accept_encoding() {
    let server = spawn_server(TransportConfig::new(), hello_world()).await;

    let (parts, body) = raw_request(&server, post(r#"["rid-1","rpc_test","hello"]"#, &[])).await;
    assert!(parts.headers.get("content-encoding").is_none());
    assert_eq!(body, &br#"["rid-1",null,"world"]"#[..]);
}

#[tokio::test]
async fn test_concurrent_replies_out_of_order() {
    let handler = handler_fn(|request| {
        let n = request.payload.as_u64().unwrap_or(0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis((10 - n) * 30)).await;
            request.reply.reply(Ok(json!(n * 2)));
        });
    });
    let server = spawn_server(TransportConfig::new(), handler).await;
    let client = Arc::new(client_for(&server, 5_000));

    let calls: Vec<_> = (0..10u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("rpc_double", json!(n), &RequestOptions::new())
                    .await
                    .map(|value| (n, value))
            })
        })
        .collect();

    for call in calls {
        let (n, value) = call.await.unwrap().unwrap();
        assert_eq!(value, json!(n * 2));
    }
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_header_rid_and_key_preferred() {
    let handler = handler_fn(|request| {
        let InboundRequest { rid, key, reply, .. } = request;
        reply.reply(Ok(json!([rid, key])));
    });
    let server = spawn_server(TransportConfig::new(), handler).await;

    let request = post(r#"["UUID","body_key","hello"]"#, &[("_gr", r#"["hdr-rid","rpc_test"]"#)]);
    let (_, body) = raw_request(&server, request).await;

    let reply = envelope::decode_reply(&body).unwrap();
    assert_eq!(reply.rid, "hdr-rid");
    assert_eq!(reply.result, json!(["hdr-rid", "rpc_test"]));
}

// ============================================================================
// Header Parsing
// ============================================================================

#[derive(Default)]
struct Calls {
    streams: AtomicUsize,
    requests: AtomicUsize,
    errors: AtomicUsize,
}

struct CountingHandler(Arc<Calls>);

impl RpcHandler for CountingHandler {
    fn on_stream(&self, stream: InboundStream) -> Option<InboundStream> {
        self.0.streams.fetch_add(1, Ordering::SeqCst);
        Some(stream)
    }

    fn on_request(&self, request: InboundRequest) {
        self.0.requests.fetch_add(1, Ordering::SeqCst);
        request.reply.reply(Ok(request.meta.args.clone()));
    }

    fn on_request_error(&self, _error: RequestError) {
        self.0.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_malformed_gr_rejected_before_dispatch() {
    let calls = Arc::new(Calls::default());
    let server = spawn_server(TransportConfig::new(), CountingHandler(calls.clone())).await;

    for bad in ["not-json", r#"["only-rid"]"#, r#"[1,"key"]"#, r#"{"rid":"a"}"#] {
        let request = post(r#"["rid","rpc_test","hello"]"#, &[("_gr", bad)]);
        let (parts, body) = raw_request(&server, request).await;
        assert_eq!(parts.status, 500, "_gr = {}", bad);
        assert_eq!(body, &br#"[null,"ERR_HEADER_PARSE_GR",null]"#[..]);
    }

    assert_eq!(calls.streams.load(Ordering::SeqCst), 0);
    assert_eq!(calls.requests.load(Ordering::SeqCst), 0);
    assert_eq!(calls.errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_args_become_empty_object() {
    let calls = Arc::new(Calls::default());
    let server = spawn_server(TransportConfig::new(), CountingHandler(calls.clone())).await;

    let request = post(
        r#"["rid","rpc_test","hello"]"#,
        &[("_gr", r#"["rid","rpc_test"]"#), ("_ar", "{broken")],
    );
    let (parts, body) = raw_request(&server, request).await;

    assert_eq!(parts.status, 200);
    assert_eq!(envelope::decode_reply(&body).unwrap().result, json!({}));
    assert_eq!(calls.streams.load(Ordering::SeqCst), 1);
    assert_eq!(calls.requests.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Request Errors
// ============================================================================

struct ErrorReporter {
    events: mpsc::UnboundedSender<(Option<String>, String)>,
}

impl RpcHandler for ErrorReporter {
    fn on_request(&self, request: InboundRequest) {
        request.reply.reply(Ok(json!("unexpected")));
    }

    fn on_request_error(&self, error: RequestError) {
        let _ = self.events.send((error.rid.clone(), error.reason.clone()));
        if let Some(reply) = error.reply {
            reply.reply(Err("ERR_BAD_BODY".to_string()));
        }
    }
}

#[tokio::test]
async fn test_garbage_without_rid_is_abandoned() {
    let (events, mut rx) = mpsc::unbounded_channel();
    let server = spawn_server(TransportConfig::new().with_timeout(300), ErrorReporter { events }).await;

    let result = try_raw_request(&server, post("definitely not json", &[])).await;
    assert!(result.is_err(), "abandoned request must not get a response");

    let (rid, reason) = rx.recv().await.unwrap();
    assert_eq!(rid, None);
    assert!(!reason.is_empty());
}

#[tokio::test]
async fn test_garbage_with_header_rid_can_be_answered() {
    let (events, mut rx) = mpsc::unbounded_channel();
    let server = spawn_server(TransportConfig::new(), ErrorReporter { events }).await;

    let request = post("definitely not json", &[("_gr", r#"["rid-bad","rpc_test"]"#)]);
    let (parts, body) = raw_request(&server, request).await;

    assert_eq!(parts.status, 200);
    assert_eq!(body, &br#"["rid-bad","ERR_BAD_BODY",null]"#[..]);
    assert_eq!(rx.recv().await.unwrap().0.as_deref(), Some("rid-bad"));
}

#[tokio::test]
async fn test_body_over_limit_is_a_request_error() {
    let (events, mut rx) = mpsc::unbounded_channel();
    let config = TransportConfig::new().with_max_body_bytes(32);
    let server = spawn_server(config, ErrorReporter { events }).await;

    let payload = format!(r#"["rid-big","rpc_test","{}"]"#, "x".repeat(256));
    let request = post(payload, &[("_gr", r#"["rid-big","rpc_test"]"#)]);
    let (_, body) = raw_request(&server, request).await;

    assert_eq!(body, &br#"["rid-big","ERR_BAD_BODY",null]"#[..]);
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn test_client_times_out_on_dropped_request() {
    let handler = handler_fn(|request| drop(request));
    let server = spawn_server(TransportConfig::new(), handler).await;
    let client = client_for(&server, 200);

    let result = client
        .request("rpc_test", json!("hello"), &RequestOptions::new())
        .await;
    assert!(matches!(result, Err(GrenacheError::RequestGeneric(ref msg)) if msg.contains("timeout")));
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_stream_takeover_sees_routing_headers() {
    let handler = StreamHandler(|stream: InboundStream| {
        if stream.meta().key() != Some("rpc_upload") {
            return Some(stream);
        }

        let (meta, body, responder) = stream.into_parts();
        tokio::spawn(async move {
            let received = body.read_to_end(1 << 20).await.unwrap();
            let rid = meta.rid().unwrap_or_default().to_string();
            responder.reply(
                &rid,
                Ok(json!({
                    "bytes": received.len(),
                    "action": meta.action,
                    "args": meta.args,
                    "chunked": meta.is_stream,
                })),
            );
        });
        None
    });
    let server = spawn_server(TransportConfig::new(), handler).await;

    let options = RequestOptions::new()
        .with_header("_a", "upload")
        .with_header("_ar", json!({"name": "a.bin"}));
    let channel = StreamClient::new(stream_config(&server, 2_000))
        .unwrap()
        .open_with_rid("stream-rid", "rpc_upload", &options)
        .unwrap();

    let response = channel.exchange(vec![7u8; 100_000]).await.unwrap();
    let reply = envelope::decode_reply(&response).unwrap();

    assert_eq!(reply.rid, "stream-rid");
    assert_eq!(
        reply.result,
        json!({"bytes": 100_000, "action": "upload", "args": {"name": "a.bin"}, "chunked": true})
    );
}

#[tokio::test]
async fn test_streamed_response() {
    let handler = StreamHandler(|stream: InboundStream| {
        let (_, _, responder) = stream.into_parts();
        let mut writer = responder.stream(http::StatusCode::OK);
        tokio::spawn(async move {
            for i in 0..3 {
                writer.write(format!("chunk-{};", i)).await.unwrap();
            }
            writer.finish();
        });
        None
    });
    let server = spawn_server(TransportConfig::new(), handler).await;

    let channel = StreamClient::new(stream_config(&server, 2_000))
        .unwrap()
        .open("rpc_feed", &RequestOptions::new())
        .unwrap();
    let (writer, reader) = channel.into_split();
    writer.finish();

    let body = reader.read_to_end().await.unwrap();
    assert_eq!(body, b"chunk-0;chunk-1;chunk-2;".to_vec());
}

#[tokio::test]
async fn test_stream_client_against_buffered_handler() {
    let server = spawn_server(TransportConfig::new(), StreamHandler(Some)).await;

    let channel = StreamClient::new(stream_config(&server, 2_000))
        .unwrap()
        .open_with_rid("hdr-rid", "rpc_test", &RequestOptions::new())
        .unwrap();
    let response = channel
        .exchange(r#"["UUID","rpc_test",{"n":1}]"#)
        .await
        .unwrap();

    let reply = envelope::decode_reply(&response).unwrap();
    assert_eq!(reply.rid, "hdr-rid");
    assert_eq!(reply.result, json!({"n": 1}));
}

#[tokio::test]
async fn test_disable_buffered_with_manual_buffer() {
    let handler = StreamHandler(|stream: InboundStream| {
        tokio::spawn(async move {
            match stream.buffer().await {
                Ok(request) => {
                    let InboundRequest { payload, reply, .. } = request;
                    reply.reply(Ok(json!({"echo": payload})));
                }
                Err(error) => {
                    if let Some(reply) = error.reply {
                        reply.reply(Err(error.reason));
                    }
                }
            }
        });
        None
    });
    let config = TransportConfig::new().with_disable_buffered(true);
    let server = spawn_server(config, handler).await;
    let client = client_for(&server, 2_000);

    let result = client
        .request("rpc_test", json!("hello"), &RequestOptions::new().with_compress(true))
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": "hello"}));
}

#[tokio::test]
async fn test_disable_buffered_skips_on_request() {
    let calls = Arc::new(Calls::default());
    let config = TransportConfig::new().with_disable_buffered(true).with_timeout(300);
    let server = spawn_server(config, CountingHandler(calls.clone())).await;
    let client = client_for(&server, 200);

    let result = client
        .request("rpc_test", json!("hello"), &RequestOptions::new())
        .await;

    assert!(matches!(result, Err(GrenacheError::RequestGeneric(_))));
    assert_eq!(calls.streams.load(Ordering::SeqCst), 1);
    assert_eq!(calls.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stream_payload_echo_keeps_json() {
    let server = spawn_server(TransportConfig::new(), StreamHandler(Some)).await;
    let client = client_for(&server, 2_000);

    let payload = json!({"list": [1, 2, 3], "nested": {"ok": true}, "none": Value::Null});
    let result = client
        .request("rpc_echo", payload.clone(), &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(result, payload);
}
