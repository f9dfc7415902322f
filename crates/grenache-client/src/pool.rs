use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::transport::HttpBody;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::dial::Dialer;

/// Pooled keep-alive connection.
///
/// Holds the HTTP/1.1 sender for one open connection plus the permit that
/// counts it against its destination's limit. Dropping the connection closes
/// the socket and frees the permit.
pub struct PooledConnection {
    sender: SendRequest<HttpBody>,
    key: String,
    idle_since: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Pool key: scheme plus destination.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True while the socket is open and it has not sat idle past `idle_timeout`.
    pub fn is_valid(&self, idle_timeout: Duration) -> bool {
        !self.sender.is_closed() && self.idle_since.elapsed() < idle_timeout
    }

    /// Sends one request and waits for the response head.
    ///
    /// The response body must be read to the end before the connection is
    /// released, otherwise the next request on it would stall.
    pub async fn send(&mut self, request: http::Request<HttpBody>) -> Result<http::Response<Incoming>> {
        self.sender.ready().await?;
        Ok(self.sender.send_request(request).await?)
    }
}

/// Connection pool configuration.
///
/// # Fields
///
/// - `max_connections`: open sockets allowed per destination
/// - `acquire_timeout_ms`: how long [`ConnectionPool::acquire`] waits for a free slot
/// - `idle_timeout_ms`: idle connections older than this are closed instead of reused
///
/// # Default Configuration
///
/// - `max_connections`: 100
/// - `acquire_timeout_ms`: 30000 (30 seconds)
/// - `idle_timeout_ms`: 60000 (60 seconds)
///
/// # Example
///
/// ```rust
/// use grenache_client::PoolConfig;
///
/// let config = PoolConfig {
///     max_connections: 20,
///     ..PoolConfig::default()
/// };
/// assert_eq!(config.idle_timeout_ms, 60_000);
/// ```
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Keep-alive connection pool shared by buffered transport clients.
///
/// # Architecture
///
/// - Idle connections are grouped by `scheme://destination`
/// - Each destination has a semaphore with `max_connections` permits; a
///   connection holds its permit for as long as it is open, idle or busy
/// - LIFO reuse, so the most recently used socket is tried first
/// - Closed or expired connections are discarded on acquisition
///
/// Streaming connections never come from the pool.
///
/// # Example
///
/// ```rust,no_run
/// use grenache_client::{ConnectionPool, Dialer, PoolConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(PoolConfig::default());
///
/// let conn = pool.acquire(&Dialer::Plain, "127.0.0.1:1337").await?;
/// // send on it, read the whole response...
/// pool.release(conn);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    config: PoolConfig,
}

struct PoolInner {
    idle: HashMap<String, Vec<PooledConnection>>,
    limits: HashMap<String, Arc<Semaphore>>,
}

impl PoolInner {
    /// Pops the most recently released live connection for `key`.
    fn take_idle(&mut self, key: &str, idle_timeout: Duration) -> Option<PooledConnection> {
        let conns = self.idle.get_mut(key)?;
        let mut found = None;
        while let Some(conn) = conns.pop() {
            if conn.is_valid(idle_timeout) {
                found = Some(conn);
                break;
            }
            tracing::debug!(key = %key, "Removing stale connection from pool");
        }
        if conns.is_empty() {
            self.idle.remove(key);
        }
        found
    }

    /// Semaphore for `key`.
    ///
    /// Adding a destination first drops the semaphores nobody holds a permit
    /// on, so the table only tracks destinations with open connections or
    /// pending acquisitions.
    fn limit_for(&mut self, key: &str, max_connections: usize) -> Arc<Semaphore> {
        if let Some(semaphore) = self.limits.get(key) {
            return semaphore.clone();
        }

        let idle = &self.idle;
        self.limits
            .retain(|key, semaphore| Arc::strong_count(semaphore) > 1 || idle.contains_key(key));

        let semaphore = Arc::new(Semaphore::new(max_connections));
        self.limits.insert(key.to_string(), semaphore.clone());
        semaphore
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                limits: HashMap::new(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquires an idle connection to `destination` or opens a new one.
    ///
    /// # Errors
    ///
    /// - [`GrenacheError::PoolTimeout`] when every slot stays busy for `acquire_timeout_ms`
    /// - Connection errors from the dialer
    pub async fn acquire(&self, dialer: &Dialer, destination: &str) -> Result<PooledConnection> {
        let key = format!("{}://{}", dialer.scheme(), destination);
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);

        let semaphore = {
            let mut inner = self.lock();
            if let Some(conn) = inner.take_idle(&key, idle_timeout) {
                return Ok(conn);
            }
            inner.limit_for(&key, self.config.max_connections)
        };

        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.acquire_timeout_ms),
            semaphore.acquire_owned(),
        )
        .await
        .map_err(|_| GrenacheError::PoolTimeout(self.config.acquire_timeout_ms))?
        .map_err(|_| GrenacheError::Transport("connection pool closed".into()))?;

        let sender = dialer.connect(destination).await?;
        tracing::debug!(key = %key, "Opened pooled connection");

        Ok(PooledConnection {
            sender,
            key,
            idle_since: Instant::now(),
            _permit: permit,
        })
    }

    /// Returns a connection for reuse. Closed connections are dropped.
    pub fn release(&self, mut conn: PooledConnection) {
        if conn.sender.is_closed() {
            return;
        }
        conn.idle_since = Instant::now();
        self.lock().idle.entry(conn.key.clone()).or_default().push(conn);
    }

    /// Number of idle connections held for `destination` under `dialer`'s scheme.
    pub fn idle_count(&self, dialer: &Dialer, destination: &str) -> usize {
        let key = format!("{}://{}", dialer.scheme(), destination);
        self.lock().idle.get(&key).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Accepts HTTP connections, answering every request with `ok`, and counts sockets.
    async fn counting_server() -> (String, Arc<AtomicUsize>) {
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count_clone.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let service = service_fn(|_req| async {
                        Ok::<_, std::convert::Infallible>(http::Response::new(
                            grenache_common::transport::HttpTransport::full("ok"),
                        ))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, count)
    }

    async fn roundtrip(conn: &mut PooledConnection) {
        use http_body_util::BodyExt;

        let request = http::Request::post("/")
            .header(http::header::HOST, "test")
            .body(grenache_common::transport::HttpTransport::empty())
            .unwrap();
        let response = conn.send(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, &b"ok"[..]);
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.acquire_timeout_ms, 30_000);
        assert_eq!(config.idle_timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn test_acquire_nonexistent_addr_fails() {
        let pool = ConnectionPool::default();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(pool.acquire(&Dialer::Plain, &addr).await.is_err());
    }

    #[tokio::test]
    async fn test_pool_reuses_released_connection() {
        let (addr, count) = counting_server().await;
        let pool = ConnectionPool::default();

        let mut conn = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        roundtrip(&mut conn).await;
        pool.release(conn);
        assert_eq!(pool.idle_count(&Dialer::Plain, &addr), 1);

        let mut conn = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        roundtrip(&mut conn).await;
        pool.release(conn);

        assert_eq!(count.load(Ordering::SeqCst), 1, "second request should reuse the socket");
    }

    #[tokio::test]
    async fn test_pool_opens_parallel_connections() {
        let (addr, count) = counting_server().await;
        let pool = ConnectionPool::default();

        let mut first = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        let mut second = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        roundtrip(&mut first).await;
        roundtrip(&mut second).await;
        pool.release(first);
        pool.release(second);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(&Dialer::Plain, &addr), 2);
    }

    #[tokio::test]
    async fn test_pool_timeout_when_full() {
        let (addr, _count) = counting_server().await;
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 100,
            ..PoolConfig::default()
        });

        let _held = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        let result = pool.acquire(&Dialer::Plain, &addr).await;
        assert!(matches!(result, Err(GrenacheError::PoolTimeout(100))));
    }

    #[tokio::test]
    async fn test_dropped_connection_frees_slot() {
        let (addr, _count) = counting_server().await;
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 500,
            ..PoolConfig::default()
        });

        let held = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        drop(held);
        assert!(pool.acquire(&Dialer::Plain, &addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_unused_destinations_are_forgotten() {
        let (first, _) = counting_server().await;
        let (second, _) = counting_server().await;
        let (third, _) = counting_server().await;
        let pool = ConnectionPool::default();

        let held = pool.acquire(&Dialer::Plain, &first).await.unwrap();
        let dropped = pool.acquire(&Dialer::Plain, &second).await.unwrap();
        drop(dropped);
        let _third = pool.acquire(&Dialer::Plain, &third).await.unwrap();

        {
            let inner = pool.lock();
            assert_eq!(inner.limits.len(), 2);
            assert!(inner.limits.contains_key(&format!("http://{}", first)));
            assert!(!inner.limits.contains_key(&format!("http://{}", second)));
        }

        pool.release(held);
        let mut again = pool.acquire(&Dialer::Plain, &first).await.unwrap();
        roundtrip(&mut again).await;
        assert!(pool.lock().idle.is_empty(), "drained idle lists are removed");
    }

    #[tokio::test]
    async fn test_expired_idle_connection_is_replaced() {
        let (addr, count) = counting_server().await;
        let pool = ConnectionPool::new(PoolConfig {
            idle_timeout_ms: 20,
            ..PoolConfig::default()
        });

        let mut conn = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        roundtrip(&mut conn).await;
        pool.release(conn);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut conn = pool.acquire(&Dialer::Plain, &addr).await.unwrap();
        roundtrip(&mut conn).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
