//! Upstream — a named pool of targets with a balancing strategy

use crate::config::{self, ServiceOptions, Strategy, UpstreamOptions};
use crate::ctx::RequestContext;
use crate::error::{BifrostError, Result};
use crate::provider::dns::DnsCache;
use crate::proxy::{client, Proxy, ProxyOptions};
use crate::vars;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// FNV-1a 32-bit, computed fresh per call so the hashing strategy is
/// deterministic per key.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// An upstream: N forwarders, one per target, plus strategy state
pub struct Upstream {
    id: String,
    strategy: Strategy,
    hash_on: Option<String>,
    proxies: Vec<Arc<Proxy>>,
    counter: AtomicU64,
    total_weight: u32,
}

impl Upstream {
    /// Build an upstream from configuration. Target hosts that need DNS are
    /// eagerly resolved; a dead name refuses to load.
    pub async fn new(
        id: &str,
        opts: &UpstreamOptions,
        service_opts: &ServiceOptions,
        resolver: &Arc<DnsCache>,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(BifrostError::Config("upstream id can't be empty".into()));
        }
        if opts.targets.is_empty() {
            return Err(BifrostError::Config(format!(
                "targets can't be empty. upstream id: {}",
                id
            )));
        }

        let scheme = service_opts.scheme().to_string();
        let base_path = service_opts.path().to_string();
        let service_port = service_opts.port();

        let mut proxies = Vec::with_capacity(opts.targets.len());
        let mut total_weight = 0u32;

        for target_opts in &opts.targets {
            total_weight += target_opts.weight;

            let (host, target_port) = target_opts.host_port();

            let needs_dns = config::allow_dns(host);
            if needs_dns {
                resolver.lookup(host).await?;
            }

            // An explicit port on the service URL overrides the target's
            let port = service_port.or(target_port);
            let url = match port {
                Some(port) => format!("{}://{}:{}{}", scheme, host, port, base_path),
                None => format!("{}://{}{}", scheme, host, base_path),
            };

            let client =
                client::build_client(service_opts, needs_dns.then(|| resolver.clone()))?;
            let proxy = Proxy::new(
                ProxyOptions {
                    target: url,
                    protocol: service_opts.protocol,
                    weight: target_opts.weight,
                    ..Default::default()
                },
                client,
            );
            proxies.push(Arc::new(proxy));
        }

        Ok(Self {
            id: id.to_string(),
            strategy: opts.strategy,
            hash_on: opts.hash_on.clone(),
            proxies,
            counter: AtomicU64::new(0),
            total_weight,
        })
    }

    /// Assemble an upstream directly from forwarders; used by tests and
    /// embedders that construct pools programmatically.
    pub fn from_proxies(id: &str, strategy: Strategy, proxies: Vec<Arc<Proxy>>) -> Self {
        let total_weight = proxies.iter().map(|p| p.weight()).sum();
        Self {
            id: id.to_string(),
            strategy,
            hash_on: None,
            proxies,
            counter: AtomicU64::new(0),
            total_weight,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    pub fn set_hash_on(&mut self, var: impl Into<String>) {
        self.hash_on = Some(var.into());
    }

    /// Select a target for this request, skipping sidelined ones. None when
    /// no target is available; the service answers 503.
    pub fn select(&self, ctx: &RequestContext) -> Option<Arc<Proxy>> {
        let available: Vec<&Arc<Proxy>> =
            self.proxies.iter().filter(|p| p.is_available()).collect();
        if available.is_empty() {
            return None;
        }
        if available.len() == 1 {
            return Some(available[0].clone());
        }

        match self.strategy {
            Strategy::RoundRobin => {
                let index = self.counter.fetch_add(1, Ordering::Relaxed);
                Some(available[(index % available.len() as u64) as usize].clone())
            }
            Strategy::Weighted => {
                let total: u32 = available.iter().map(|p| p.weight()).sum();
                if total == 0 {
                    return Some(available[0].clone());
                }
                let mut remaining = rand::thread_rng().gen_range(0..total) as i64;
                for proxy in &available {
                    remaining -= proxy.weight() as i64;
                    if remaining < 0 {
                        return Some((*proxy).clone());
                    }
                }
                available.last().map(|p| (*p).clone())
            }
            Strategy::Random => {
                let index = rand::thread_rng().gen_range(0..available.len());
                Some(available[index].clone())
            }
            Strategy::Hashing => {
                let key = self
                    .hash_on
                    .as_deref()
                    .and_then(|name| vars::get(name, ctx))
                    .unwrap_or_default();
                let index = fnv1a_32(key.as_bytes()) as usize % available.len();
                Some(available[index].clone())
            }
        }
    }

    /// Total configured weight across all targets
    pub fn total_weight(&self) -> u32 {
        self.total_weight
    }
}

/// Build a forwarder for a target that needs no upstream (direct mode)
pub async fn build_direct_proxy(
    service_opts: &ServiceOptions,
    resolver: &Arc<DnsCache>,
) -> Result<Proxy> {
    let hostname = service_opts.hostname()?;

    let needs_dns = config::allow_dns(&hostname);
    if needs_dns {
        resolver.lookup(&hostname).await?;
    }

    let url = match service_opts.port() {
        Some(port) => format!(
            "{}://{}:{}{}",
            service_opts.scheme(),
            hostname,
            port,
            service_opts.path()
        ),
        None => format!(
            "{}://{}{}",
            service_opts.scheme(),
            hostname,
            service_opts.path()
        ),
    };

    let client = client::build_client(service_opts, needs_dns.then(|| resolver.clone()))?;
    Ok(Proxy::new(
        ProxyOptions {
            target: url,
            protocol: service_opts.protocol,
            weight: 0,
            ..Default::default()
        },
        client,
    ))
}
