//! Pooled client construction — one client per service/target
//!
//! Maps the service timeouts, pool limits, protocol and TLS-verify flag
//! onto the HTTP client, and wires in the shared DNS cache so dialers look
//! up through it.

use crate::config::{Protocol, ServiceOptions};
use crate::error::Result;
use crate::provider::dns::DnsCache;
use std::sync::Arc;
use std::time::Duration;

/// Build a pooled client for one service
pub fn build_client(opts: &ServiceOptions, resolver: Option<Arc<DnsCache>>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(ms) = opts.timeout.connect_ms {
        builder = builder.connect_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = opts.timeout.read_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    if let Some(n) = opts.max_conns_per_host {
        builder = builder.pool_max_idle_per_host(n);
    }

    if opts.protocol == Protocol::Http2 {
        builder = builder.http2_prior_knowledge();
    }

    if opts.scheme().eq_ignore_ascii_case("https") {
        builder = builder.danger_accept_invalid_certs(!opts.tls_verify);
    }

    if let Some(resolver) = resolver {
        builder = builder.dns_resolver(resolver);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(yaml: &str) -> ServiceOptions {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_build_default_client() {
        let opts = svc("url: http://127.0.0.1:8000");
        assert!(build_client(&opts, None).is_ok());
    }

    #[test]
    fn test_build_with_timeouts_and_pool() {
        let opts = svc(
            r#"
url: https://backend:8443
tls_verify: false
max_conns_per_host: 32
timeout:
  connect_ms: 500
  read_ms: 3000
  max_conn_wait_ms: 1000
"#,
        );
        assert!(build_client(&opts, None).is_ok());
    }

    #[test]
    fn test_build_http2_client() {
        let opts = svc("url: http://backend:8080\nprotocol: http2");
        assert!(build_client(&opts, None).is_ok());
    }

    #[test]
    fn test_build_with_resolver() {
        let opts = svc("url: http://backend.internal:8080");
        let cache = Arc::new(DnsCache::new());
        assert!(build_client(&opts, Some(cache)).is_ok());
    }
}
