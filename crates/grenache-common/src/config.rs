//! Transport configuration shared by clients and servers.

use std::time::Duration;

use crate::tls::SecureCredentials;

/// Timeout applied when neither the config nor the call sets one.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Largest body the server spools in the buffered phase.
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Configuration owned by one client or server instance.
///
/// # Fields
///
/// - `destination`: `host:port` a client talks to (unused by servers)
/// - `secure`: TLS credentials; `None` means plain HTTP
/// - `timeout`: clients bound each exchange by it; servers hold a request
///   that will never be answered for this long before closing its connection
/// - `disable_buffered`: server skips the buffered phase entirely
/// - `max_body_bytes`: buffered phase body limit
///
/// # Example
///
/// ```
/// use grenache_common::TransportConfig;
///
/// let config = TransportConfig::for_destination("127.0.0.1:1337").with_timeout(500);
/// assert_eq!(config.destination.as_deref(), Some("127.0.0.1:1337"));
/// assert_eq!(config.timeout().as_millis(), 500);
/// assert_eq!(config.scheme(), "http");
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub destination: Option<String>,
    pub secure: Option<SecureCredentials>,
    pub timeout: Option<Duration>,
    pub disable_buffered: bool,
    pub max_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            destination: None,
            secure: None,
            timeout: None,
            disable_buffered: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::default()
        }
    }

    pub fn with_secure(mut self, secure: SecureCredentials) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(Duration::from_millis(timeout_ms));
        self
    }

    pub fn with_disable_buffered(mut self, disable: bool) -> Self {
        self.disable_buffered = disable;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Effective timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure.is_some() {
            "https"
        } else {
            "http"
        }
    }
}
