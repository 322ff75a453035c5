//! Service configuration — logical backends and their clients

use serde::{Deserialize, Serialize};

use crate::error::{BifrostError, Result};

/// Protocol spoken to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// HTTP/1.1
    #[default]
    Http,
    /// HTTP/2 (prior knowledge on cleartext, ALPN over TLS)
    Http2,
}

/// Service configuration
///
/// The `url` hostname selects the mode: an upstream id delegates selection
/// to that upstream, a leading `$` defers the upstream choice to request
/// time, anything else is proxied directly.
///
/// # Example
///
/// ```yaml
/// services:
///   orders:
///     url: http://orders_cluster
///     protocol: http
///     timeout:
///       connect_ms: 500
///       read_ms: 3000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOptions {
    /// Target URL template
    pub url: String,

    /// Protocol to the backend
    #[serde(default)]
    pub protocol: Protocol,

    /// Client timeouts
    #[serde(default)]
    pub timeout: ServiceTimeoutOptions,

    /// Verify the backend TLS certificate
    #[serde(default = "default_true")]
    pub tls_verify: bool,

    /// Connection pool cap per backend host
    #[serde(default)]
    pub max_conns_per_host: Option<usize>,

    /// Service middleware ids, appended after route middlewares
    #[serde(default)]
    pub middlewares: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServiceOptions {
    /// URL scheme; defaults to http when the URL carries none
    pub fn scheme(&self) -> &str {
        match self.url.split_once("://") {
            Some((scheme, _)) => scheme,
            None => "http",
        }
    }

    /// Hostname component of the URL (no port, no path)
    pub fn hostname(&self) -> Result<String> {
        let (host, _) = self.split_host_port()?;
        Ok(host)
    }

    /// Explicit port in the URL, if any
    pub fn port(&self) -> Option<u16> {
        self.split_host_port().ok()?.1
    }

    /// Path component of the URL ("" when absent)
    pub fn path(&self) -> &str {
        let rest = match self.url.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.url,
        };
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        }
    }

    fn split_host_port(&self) -> Result<(String, Option<u16>)> {
        let rest = match self.url.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.url,
        };
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(BifrostError::Config(format!(
                "service url '{}' has no host",
                self.url
            )));
        }

        // Bracketed IPv6 literal
        if let Some(stripped) = authority.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| {
                BifrostError::Config(format!("service url '{}' has an unclosed '['", self.url))
            })?;
            let host = format!("[{}]", &stripped[..end]);
            let port = stripped[end + 1..]
                .strip_prefix(':')
                .map(|p| {
                    p.parse::<u16>().map_err(|_| {
                        BifrostError::Config(format!("service url '{}' has a bad port", self.url))
                    })
                })
                .transpose()?;
            return Ok((host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    BifrostError::Config(format!("service url '{}' has a bad port", self.url))
                })?;
                Ok((host.to_string(), Some(port)))
            }
            None => Ok((authority.to_string(), None)),
        }
    }
}

/// Client timeouts, in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceTimeoutOptions {
    /// Connect (dial) timeout
    #[serde(default)]
    pub connect_ms: Option<u64>,

    /// Read timeout for the whole exchange
    #[serde(default)]
    pub read_ms: Option<u64>,

    /// Write timeout
    #[serde(default)]
    pub write_ms: Option<u64>,

    /// Wait for a free pooled connection
    #[serde(default)]
    pub max_conn_wait_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(url: &str) -> ServiceOptions {
        serde_yaml::from_str(&format!("url: {}", url)).unwrap()
    }

    #[test]
    fn test_defaults() {
        let opts = svc("http://127.0.0.1:8000");
        assert_eq!(opts.protocol, Protocol::Http);
        assert!(opts.tls_verify);
        assert!(opts.max_conns_per_host.is_none());
    }

    #[test]
    fn test_url_parts() {
        let opts = svc("https://backend.internal:8443/base");
        assert_eq!(opts.scheme(), "https");
        assert_eq!(opts.hostname().unwrap(), "backend.internal");
        assert_eq!(opts.port(), Some(8443));
        assert_eq!(opts.path(), "/base");
    }

    #[test]
    fn test_url_no_port_no_path() {
        let opts = svc("http://cluster1");
        assert_eq!(opts.hostname().unwrap(), "cluster1");
        assert_eq!(opts.port(), None);
        assert_eq!(opts.path(), "");
    }

    #[test]
    fn test_url_dynamic_host() {
        let opts = svc("http://$backend");
        assert_eq!(opts.hostname().unwrap(), "$backend");
    }

    #[test]
    fn test_url_ipv6() {
        let opts = svc("\"http://[::1]:9000/x\"");
        assert_eq!(opts.hostname().unwrap(), "[::1]");
        assert_eq!(opts.port(), Some(9000));
        assert_eq!(opts.path(), "/x");
    }

    #[test]
    fn test_url_bad_port() {
        let opts = svc("http://host:notaport");
        assert!(opts.hostname().is_err());
    }

    #[test]
    fn test_protocol_parse() {
        let opts: ServiceOptions =
            serde_yaml::from_str("url: http://a\nprotocol: http2").unwrap();
        assert_eq!(opts.protocol, Protocol::Http2);
    }
}
