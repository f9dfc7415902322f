use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrenacheError {
    /// Transport failure or timeout while performing a buffered exchange.
    #[error("ERR_REQUEST_GENERIC: {0}")]
    RequestGeneric(String),

    #[error("ERR_REPLY_EMPTY")]
    ReplyEmpty,

    #[error("ERR_REQUEST_ENCODING_COMPRESSION")]
    RequestEncodingCompression,

    #[error("ERR_REPLY_ENCODING_COMPRESSION")]
    ReplyEncodingCompression,

    #[error("ERR_HEADER_PARSE_GR")]
    HeaderParseGr,

    /// Error message carried in the second slot of a reply envelope.
    #[error("{0}")]
    Remote(String),

    #[error("ERR_LOOKUP_EMPTY: no destination announced for {0}")]
    LookupEmpty(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Pool acquisition timeout after {0}ms")]
    PoolTimeout(u64),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GrenacheError {
    /// Wire code for this error, as it appears in reply envelopes and logs.
    pub fn code(&self) -> &'static str {
        match self {
            GrenacheError::RequestGeneric(_)
            | GrenacheError::PoolTimeout(_)
            | GrenacheError::Transport(_) => "ERR_REQUEST_GENERIC",
            GrenacheError::ReplyEmpty => "ERR_REPLY_EMPTY",
            GrenacheError::RequestEncodingCompression => "ERR_REQUEST_ENCODING_COMPRESSION",
            GrenacheError::ReplyEncodingCompression => "ERR_REPLY_ENCODING_COMPRESSION",
            GrenacheError::HeaderParseGr => "ERR_HEADER_PARSE_GR",
            GrenacheError::Remote(_) => "ERR_REMOTE",
            GrenacheError::LookupEmpty(_) => "ERR_LOOKUP_EMPTY",
            GrenacheError::TlsConfig(_) => "ERR_TLS_CONFIG",
            GrenacheError::StreamClosed => "ERR_STREAM_CLOSED",
            GrenacheError::JsonSerialization(_) => "ERR_JSON",
            GrenacheError::Io(_) => "ERR_IO",
        }
    }

    /// Collapses any failure of a buffered exchange into `ERR_REQUEST_GENERIC`,
    /// keeping the underlying message. Envelope-level errors pass through.
    pub fn into_request_generic(self) -> Self {
        match self {
            GrenacheError::RequestGeneric(_)
            | GrenacheError::ReplyEmpty
            | GrenacheError::RequestEncodingCompression
            | GrenacheError::ReplyEncodingCompression
            | GrenacheError::Remote(_) => self,
            GrenacheError::Transport(msg) => GrenacheError::RequestGeneric(msg),
            other => GrenacheError::RequestGeneric(other.to_string()),
        }
    }
}

impl From<hyper::Error> for GrenacheError {
    fn from(err: hyper::Error) -> Self {
        GrenacheError::Transport(err.to_string())
    }
}

impl From<http::Error> for GrenacheError {
    fn from(err: http::Error) -> Self {
        GrenacheError::Transport(err.to_string())
    }
}

impl From<rustls::Error> for GrenacheError {
    fn from(err: rustls::Error) -> Self {
        GrenacheError::TlsConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GrenacheError>;
