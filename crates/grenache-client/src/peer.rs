//! Peer client: resolves service keys to destinations and drives the
//! transport clients.
//!
//! Discovery is behind the [`Link`] trait. The peer keeps one
//! [`TransportClient`] per destination, all sharing a single
//! [`ConnectionPool`], and assigns a uuid v4 rid to every call.

use async_trait::async_trait;
use futures_util::future::join_all;
use grenache_common::protocol::error::{GrenacheError, Result};
use grenache_common::protocol::RequestOptions;
use grenache_common::{SecureCredentials, TransportConfig};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::client::TransportClient;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::stream::{DuplexChannel, StreamClient};

/// Discovery layer: which destinations currently announce a key.
#[async_trait]
pub trait Link: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Vec<String>>;
}

/// In-memory [`Link`] backed by a fixed table.
#[derive(Debug, Default)]
pub struct StaticLink {
    table: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `destination` serves `key`.
    pub fn announce(&self, key: impl Into<String>, destination: impl Into<String>) {
        let destination = destination.into();
        let mut table = self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = table.entry(key.into()).or_default();
        if !entries.contains(&destination) {
            entries.push(destination);
        }
    }

    pub fn withdraw(&self, key: &str, destination: &str) {
        let mut table = self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entries) = table.get_mut(key) {
            entries.retain(|d| d != destination);
        }
    }
}

#[async_trait]
impl Link for StaticLink {
    async fn lookup(&self, key: &str) -> Result<Vec<String>> {
        let table = self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(table.get(key).cloned().unwrap_or_default())
    }
}

/// Settings shared by every transport client the peer creates.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub secure: Option<SecureCredentials>,
    pub timeout: Option<Duration>,
    pub pool: PoolConfig,
}

/// Requests services by key through a [`Link`].
///
/// # Example
///
/// ```rust,no_run
/// use grenache_client::{Link, PeerConfig, PeerRpcClient, StaticLink};
/// use grenache_common::RequestOptions;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let link = Arc::new(StaticLink::new());
/// link.announce("rpc_test", "127.0.0.1:1337");
///
/// let peer = PeerRpcClient::new(link, PeerConfig::default());
/// let result = peer.request("rpc_test", json!("hello"), &RequestOptions::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerRpcClient {
    link: Arc<dyn Link>,
    config: PeerConfig,
    pool: Arc<ConnectionPool>,
    /// One client per destination ever resolved; lives as long as the peer.
    /// Sockets are not held here, they stay in the shared pool.
    transports: Mutex<HashMap<String, Arc<TransportClient>>>,
}

impl PeerRpcClient {
    pub fn new(link: Arc<dyn Link>, config: PeerConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        Self {
            link,
            config,
            pool,
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `payload` to one destination announcing `key`, chosen at random.
    ///
    /// # Errors
    ///
    /// `ERR_LOOKUP_EMPTY` when nobody announces `key`; otherwise the transport
    /// client's errors.
    pub async fn request(&self, key: &str, payload: Value, options: &RequestOptions) -> Result<Value> {
        let destinations = self.resolve(key).await?;
        let destination = destinations
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| GrenacheError::LookupEmpty(key.to_string()))?;

        self.transport(destination)?
            .request(key, payload, options)
            .await
    }

    /// Sends `payload` to every destination announcing `key`.
    ///
    /// Results come back in lookup order; the first failure wins.
    pub async fn map(&self, key: &str, payload: Value, options: &RequestOptions) -> Result<Vec<Value>> {
        let destinations = self.resolve(key).await?;
        let transports = destinations
            .iter()
            .map(|destination| self.transport(destination))
            .collect::<Result<Vec<_>>>()?;

        let calls = transports
            .iter()
            .map(|transport| transport.request(key, payload.clone(), options));

        join_all(calls).await.into_iter().collect()
    }

    /// Opens a duplex stream to one destination announcing `key`.
    pub async fn stream(&self, key: &str, options: &RequestOptions) -> Result<DuplexChannel> {
        let destinations = self.resolve(key).await?;
        let destination = destinations
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| GrenacheError::LookupEmpty(key.to_string()))?;

        StreamClient::new(self.transport_config(destination))?.open(key, options)
    }

    async fn resolve(&self, key: &str) -> Result<Vec<String>> {
        let destinations = self.link.lookup(key).await?;
        if destinations.is_empty() {
            return Err(GrenacheError::LookupEmpty(key.to_string()));
        }
        Ok(destinations)
    }

    fn transport(&self, destination: &str) -> Result<Arc<TransportClient>> {
        let mut transports = self.transports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = transports.get(destination) {
            return Ok(existing.clone());
        }

        let client = Arc::new(TransportClient::new(
            self.transport_config(destination),
            self.pool.clone(),
        )?);
        transports.insert(destination.to_string(), client.clone());
        Ok(client)
    }

    fn transport_config(&self, destination: &str) -> TransportConfig {
        TransportConfig {
            destination: Some(destination.to_string()),
            secure: self.config.secure.clone(),
            timeout: self.config.timeout,
            ..TransportConfig::default()
        }
    }
}
