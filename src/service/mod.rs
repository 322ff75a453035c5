//! Service — resolves a request to a forwarder and runs it
//!
//! A service is one of three modes, decided at load time from its URL
//! hostname: direct (a single forwarder), static upstream (the hostname is
//! an upstream id), or dynamic (the hostname starts with `$` and the
//! upstream id is read from that request variable at request time).

pub mod health;
pub mod upstream;

pub use upstream::Upstream;

use crate::config::{Options, ServiceOptions};
use crate::ctx::{RequestContext, VarValue};
use crate::engine::Handler;
use crate::error::{BifrostError, Result};
use crate::provider::dns::DnsCache;
use crate::proxy::{Proxy, ProxyRequest};
use crate::vars;
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A loaded service
pub struct Service {
    id: String,
    upstreams: HashMap<String, Arc<Upstream>>,
    proxy: Option<Arc<Proxy>>,
    upstream: Option<Arc<Upstream>>,
    dynamic_upstream: Option<String>,
}

/// Build every configured service. Each service owns its own upstream
/// instances so its client timeouts apply to every target it may reach.
pub async fn load_services(
    options: &Options,
    resolver: &Arc<DnsCache>,
) -> Result<HashMap<String, Arc<Service>>> {
    let mut services = HashMap::new();
    for (id, service_opts) in &options.services {
        if id.is_empty() {
            return Err(BifrostError::Config("service id can't be empty".into()));
        }
        let service = Service::new(id, service_opts, options, resolver).await?;
        services.insert(id.clone(), Arc::new(service));
    }
    Ok(services)
}

impl Service {
    pub async fn new(
        id: &str,
        opts: &ServiceOptions,
        options: &Options,
        resolver: &Arc<DnsCache>,
    ) -> Result<Self> {
        let mut upstreams = HashMap::new();
        for (upstream_id, upstream_opts) in &options.upstreams {
            let upstream =
                Upstream::new(upstream_id, upstream_opts, opts, resolver).await?;
            upstreams.insert(upstream_id.clone(), Arc::new(upstream));
        }

        let hostname = opts.hostname()?;
        if hostname.is_empty() {
            return Err(BifrostError::Config(format!(
                "service host can't be empty. service_id: {}",
                id
            )));
        }

        let mut service = Self {
            id: id.to_string(),
            upstreams,
            proxy: None,
            upstream: None,
            dynamic_upstream: None,
        };

        if hostname.starts_with('$') {
            service.dynamic_upstream = Some(hostname);
            return Ok(service);
        }

        if let Some(upstream) = service.upstreams.get(&hostname) {
            service.upstream = Some(upstream.clone());
            return Ok(service);
        }

        let proxy = upstream::build_direct_proxy(opts, resolver).await?;
        service.proxy = Some(Arc::new(proxy));
        Ok(service)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolve the forwarder for this request
    fn select_proxy(&self, ctx: &mut RequestContext) -> Option<Arc<Proxy>> {
        if let Some(proxy) = &self.proxy {
            return Some(proxy.clone());
        }

        let upstream = if let Some(var_name) = &self.dynamic_upstream {
            let name = ctx.get_str(var_name).unwrap_or("").to_string();
            if name.is_empty() {
                tracing::warn!(path = ctx.path(), "upstream is empty");
                return None;
            }
            match self.upstreams.get(&name) {
                Some(upstream) => upstream.clone(),
                None => {
                    tracing::warn!(name = %name, "upstream is not found");
                    return None;
                }
            }
        } else {
            self.upstream.clone()?
        };

        ctx.set_str(vars::UPSTREAM, upstream.id());
        upstream.select(ctx)
    }
}

#[async_trait]
impl Handler for Service {
    async fn handle(&self, ctx: &mut RequestContext) {
        let proxy = match self.select_proxy(ctx) {
            Some(proxy) => proxy,
            None => {
                tracing::error!(
                    request_uri = %format!("{} {} {}", ctx.method(), ctx.path(), ctx.protocol()),
                    upstream_uri = ctx.path(),
                    host = ctx.host().unwrap_or(""),
                    "no live upstream"
                );
                ctx.set_status(StatusCode::SERVICE_UNAVAILABLE);
                ctx.abort();
                return;
            }
        };

        ctx.set_str(vars::UPSTREAM_ADDR, proxy.target_host());

        let proxy_req = ProxyRequest {
            method: ctx.method().clone(),
            path: ctx.path().to_string(),
            query: ctx.query().map(str::to_string),
            headers: ctx.head.headers.clone(),
            body: ctx.body.clone(),
            peer_ip: ctx.remote_addr.ip().to_string(),
            on_upgrade: ctx.on_upgrade.take(),
            // Pre-populated response headers survive the proxy call
            saved_resp_headers: ctx.resp.headers.clone(),
        };

        let start = Instant::now();
        let task = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.forward(proxy_req).await })
        };
        let cancelled = ctx.cancel.clone();

        tokio::select! {
            _ = cancelled.cancelled() => {
                // The in-flight proxy call runs to completion in the
                // background so its connection returns to the pool.
                ctx.set(vars::CLIENT_CANCELED_AT, VarValue::Time(chrono::Utc::now()));
                tracing::warn!(full_uri = %ctx.full_uri(), "client cancel the request");
                ctx.set_status(StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST));
            }
            joined = task => {
                let micros = start.elapsed().as_micros() as i64;
                ctx.set_str(vars::UPSTREAM_RESPONSE_TIME, vars::format_seconds(micros));

                match joined {
                    Err(e) => {
                        tracing::error!(
                            panic = %e,
                            full_uri = %ctx.full_uri(),
                            "proxy panic recovered"
                        );
                        ctx.resp.headers = HeaderMap::new();
                        ctx.respond(StatusCode::INTERNAL_SERVER_ERROR, "");
                    }
                    Ok(outcome) => {
                        if let Some(chain) = &outcome.forwarded_for {
                            ctx.set_str("X-Forwarded-For", chain.as_str());
                        }
                        ctx.resp.headers = outcome.headers;
                        ctx.resp_body = outcome.body;

                        if outcome.target_timeout {
                            ctx.set(vars::TARGET_TIMEOUT, VarValue::Bool(true));
                            ctx.set_status(StatusCode::GATEWAY_TIMEOUT);
                        } else {
                            ctx.set_status(outcome.status);
                            ctx.set_str(vars::UPSTREAM_STATUS, outcome.status.as_u16().to_string());
                        }

                        if outcome.status.as_u16() >= 500 && proxy.add_failed_count(1) {
                            tracing::warn!(
                                upstream = proxy.target_host(),
                                "upstream server temporarily disabled"
                            );
                        }
                    }
                }
            }
        }

        ctx.abort();
    }
}
