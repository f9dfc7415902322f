//! Reply side of an inbound request.
//!
//! Every inbound request owns exactly one [`Responder`]. Replying consumes
//! it, so a request cannot be answered twice. A responder dropped without a
//! reply abandons the request: the connection stays open until the server's
//! timeout and is then closed, and the caller observes a timeout.

use bytes::Bytes;
use grenache_common::protocol::error::Result;
use grenache_common::transport::{BodySender, HttpTransport, HyperResponse};
use http::StatusCode;
use serde_json::Value;
use tokio::sync::oneshot;

/// Chunks buffered in a streamed response before the writer waits.
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

pub(crate) enum Outcome {
    Respond(HyperResponse),
    Abandon,
}

/// Writes the single response of one inbound request.
pub struct Responder {
    tx: Option<oneshot::Sender<Outcome>>,
    compress: bool,
}

impl Responder {
    pub(crate) fn new(compress: bool) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx), compress }, rx)
    }

    /// Whether replies will be gzipped for this caller.
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Answers with the envelope `[rid, errorMessage, result]`.
    pub fn reply(self, rid: &str, result: std::result::Result<Value, String>) {
        match result {
            Ok(value) => self.reply_envelope(rid, None, &value),
            Err(message) => self.reply_envelope(rid, Some(&message), &Value::Null),
        }
    }

    /// Answers with an envelope carrying both slots as given.
    pub fn reply_envelope(mut self, rid: &str, error: Option<&str>, result: &Value) {
        let response = HttpTransport::reply_response(rid, error, result, self.compress);
        self.finish(Outcome::Respond(response));
    }

    /// Sends a fully custom response.
    pub fn respond(mut self, response: HyperResponse) {
        self.finish(Outcome::Respond(response));
    }

    /// Starts a raw streamed response with `status`; bytes written to the
    /// returned writer become the response body.
    pub fn stream(mut self, status: StatusCode) -> ResponseWriter {
        let (sender, body) = HttpTransport::channel(RESPONSE_CHANNEL_CAPACITY);
        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        self.finish(Outcome::Respond(response));
        ResponseWriter { sender }
    }

    /// Gives up on the request without replying.
    pub fn abandon(mut self) {
        self.finish(Outcome::Abandon);
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(tx) = self.tx.take() {
            if tx.send(outcome).is_err() {
                tracing::debug!("Connection closed before the reply was sent");
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.finish(Outcome::Abandon);
    }
}

/// Body writer of a response started with [`Responder::stream`].
pub struct ResponseWriter {
    sender: BodySender,
}

impl ResponseWriter {
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.sender.send(chunk.into()).await
    }

    /// Ends the response body.
    pub fn finish(self) {}

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Replies to one decoded request; bound to its rid.
pub struct ReplyHandler {
    rid: String,
    responder: Responder,
}

impl ReplyHandler {
    pub(crate) fn new(rid: String, responder: Responder) -> Self {
        Self { rid, responder }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    /// Answers with `[rid, null, value]` or `[rid, message, null]`.
    pub fn reply(self, result: std::result::Result<Value, String>) {
        let ReplyHandler { rid, responder } = self;
        responder.reply(&rid, result);
    }

    pub fn into_responder(self) -> Responder {
        self.responder
    }
}
