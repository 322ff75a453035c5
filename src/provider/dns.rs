//! Shared DNS cache — eager resolution at load, hourly refresh
//!
//! Every upstream target and direct-service host that is not an IP literal
//! or a local name is resolved through this cache. Per-service clients
//! resolve through it as well, so a refresh reaches all dialers at once.

use crate::error::{BifrostError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Refresh interval for cached records
const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared DNS cache
#[derive(Clone, Default)]
pub struct DnsCache {
    entries: Arc<RwLock<HashMap<String, Vec<IpAddr>>>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a host, populating the cache. Used eagerly at load time so a
    /// dead name refuses to start rather than failing at request time.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.cached(host) {
            return Ok(addrs);
        }
        self.resolve(host).await
    }

    /// Cached addresses for a host, if any
    pub fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.entries.read().unwrap().get(host).cloned()
    }

    /// Number of cached hosts
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|e| BifrostError::DnsLookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .map(|sa| sa.ip())
            .collect();

        if addrs.is_empty() {
            return Err(BifrostError::DnsLookup {
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            });
        }

        self.entries
            .write()
            .unwrap()
            .insert(host.to_string(), addrs.clone());
        Ok(addrs)
    }

    /// Re-resolve every cached host. Hosts that fail keep their previous
    /// records.
    pub async fn refresh(&self) {
        let hosts: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        for host in hosts {
            if let Err(e) = self.resolve(&host).await {
                tracing::warn!(host = %host, error = %e, "dns refresh failed, keeping stale records");
            }
        }
    }

    /// Spawn the hourly refresh task; stops when `stop` fires.
    pub fn spawn_refresh(&self, stop: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        cache.refresh().await;
                        tracing::info!("dns cache refreshed");
                    }
                }
            }
        });
    }
}

impl reqwest::dns::Resolve for DnsCache {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let cache = self.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            match cache.lookup(&host).await {
                Ok(addrs) => {
                    // The port is filled in by the caller
                    let iter: Box<dyn Iterator<Item = SocketAddr> + Send> =
                        Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)));
                    Ok(iter)
                }
                Err(e) => Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    e.to_string(),
                )) as Box<dyn std::error::Error + Send + Sync>),
            }
        })
    }
}
