//! Configuration types for Bifrost
//!
//! Defines the configuration model following the
//! server → route → middleware → service → upstream architecture.
//! Supports YAML and TOML configuration file formats.

mod access_log;
mod middleware;
mod route;
mod server;
mod service;
mod upstream;

pub use access_log::{AccessLogOptions, Escape};
pub use middleware::MiddlewareOptions;
pub use route::RouteOptions;
pub use server::{ServerOptions, ServerTimeoutOptions, TlsOptions};
pub use service::{Protocol, ServiceOptions, ServiceTimeoutOptions};
pub use upstream::{Strategy, TargetOptions, UpstreamOptions};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use crate::error::{BifrostError, Result};

/// Top-level gateway configuration
///
/// The format is auto-detected by file extension when using `from_file()`:
/// `.yaml`/`.yml` parse as YAML (the default), `.toml` as TOML.
///
/// # YAML Example
///
/// ```yaml
/// servers:
///   apiv1:
///     bind: 0.0.0.0:8001
///
/// routes:
///   all:
///     paths: ["/"]
///     service_id: backend
///
/// services:
///   backend:
///     url: http://127.0.0.1:8000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    /// Servers: named listeners, each owning an engine
    #[serde(default)]
    pub servers: HashMap<String, ServerOptions>,

    /// Routes: match predicates selecting a service
    #[serde(default)]
    pub routes: HashMap<String, RouteOptions>,

    /// Services: logical backends
    #[serde(default)]
    pub services: HashMap<String, ServiceOptions>,

    /// Upstreams: named target pools with a balancing strategy
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamOptions>,

    /// Middlewares: named middleware configurations
    #[serde(default)]
    pub middlewares: HashMap<String, MiddlewareOptions>,

    /// Access logs: named template-driven request log writers
    #[serde(default)]
    pub access_logs: HashMap<String, AccessLogOptions>,

    /// Configuration providers
    #[serde(default)]
    pub providers: ProviderOptions,

    /// Distributed tracing toggle
    #[serde(default)]
    pub tracing: TracingOptions,

    /// Metrics exposition
    #[serde(default)]
    pub metrics: MetricsOptions,

    /// Process logging
    #[serde(default)]
    pub logging: LoggingOptions,
}

impl Options {
    /// Load configuration from a file, auto-detecting format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BifrostError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| BifrostError::Config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BifrostError::Config(format!("Failed to parse TOML config: {}", e)))
    }

    /// Merge another configuration document into this one, section by section.
    ///
    /// An id that already exists in the same section is a load error — merged
    /// provider files may only add entries, never silently replace them.
    pub fn merge(&mut self, other: Options) -> Result<()> {
        merge_section(&mut self.servers, other.servers, "servers")?;
        merge_section(&mut self.routes, other.routes, "routes")?;
        merge_section(&mut self.services, other.services, "services")?;
        merge_section(&mut self.upstreams, other.upstreams, "upstreams")?;
        merge_section(&mut self.middlewares, other.middlewares, "middlewares")?;
        merge_section(&mut self.access_logs, other.access_logs, "access_logs")?;
        Ok(())
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        let mut binds = HashMap::new();
        for (id, server) in &self.servers {
            if id.is_empty() {
                return Err(BifrostError::Config("server id can't be empty".into()));
            }
            if server.bind.is_empty() {
                return Err(BifrostError::Config(format!(
                    "server '{}' bind can't be empty",
                    id
                )));
            }
            if let Some(prev) = binds.insert(server.bind.clone(), id.clone()) {
                return Err(BifrostError::Config(format!(
                    "servers '{}' and '{}' share bind '{}'",
                    prev, id, server.bind
                )));
            }
            for mw in &server.middlewares {
                if !self.middlewares.contains_key(mw) {
                    return Err(BifrostError::Config(format!(
                        "server '{}' references unknown middleware '{}'",
                        id, mw
                    )));
                }
            }
            if let Some(log_id) = &server.access_log_id {
                match self.access_logs.get(log_id) {
                    Some(log) if log.enabled => {}
                    Some(_) => {
                        return Err(BifrostError::Config(format!(
                            "server '{}' references disabled access log '{}'",
                            id, log_id
                        )));
                    }
                    None => {
                        return Err(BifrostError::Config(format!(
                            "server '{}' references unknown access log '{}'",
                            id, log_id
                        )));
                    }
                }
            }
        }

        for (id, route) in &self.routes {
            if id.is_empty() {
                return Err(BifrostError::Config("route id can't be empty".into()));
            }
            if route.paths.is_empty() {
                return Err(BifrostError::Config(format!(
                    "route '{}' has no paths",
                    id
                )));
            }
            if !self.services.contains_key(&route.service_id) {
                return Err(BifrostError::Config(format!(
                    "route '{}' references unknown service '{}'",
                    id, route.service_id
                )));
            }
            for mw in &route.middlewares {
                if !self.middlewares.contains_key(mw) {
                    return Err(BifrostError::Config(format!(
                        "route '{}' references unknown middleware '{}'",
                        id, mw
                    )));
                }
            }
        }

        for (id, service) in &self.services {
            if id.is_empty() {
                return Err(BifrostError::Config("service id can't be empty".into()));
            }
            let host = service.hostname()?;
            if host.is_empty() {
                return Err(BifrostError::Config(format!(
                    "service '{}' host can't be empty",
                    id
                )));
            }
            for mw in &service.middlewares {
                if !self.middlewares.contains_key(mw) {
                    return Err(BifrostError::Config(format!(
                        "service '{}' references unknown middleware '{}'",
                        id, mw
                    )));
                }
            }
        }

        for (id, upstream) in &self.upstreams {
            if id.is_empty() {
                return Err(BifrostError::Config("upstream id can't be empty".into()));
            }
            if upstream.targets.is_empty() {
                return Err(BifrostError::Config(format!(
                    "upstream '{}' has no targets",
                    id
                )));
            }
            if upstream.strategy == Strategy::Weighted {
                for target in &upstream.targets {
                    if target.weight == 0 {
                        return Err(BifrostError::Config(format!(
                            "upstream '{}' target '{}': weight can't be 0 with weighted strategy",
                            id, target.target
                        )));
                    }
                }
            }
            if upstream.strategy == Strategy::Hashing && upstream.hash_on.is_none() {
                return Err(BifrostError::Config(format!(
                    "upstream '{}' uses hashing strategy but has no hash_on variable",
                    id
                )));
            }
        }

        Ok(())
    }
}

fn merge_section<T>(
    base: &mut HashMap<String, T>,
    other: HashMap<String, T>,
    section: &str,
) -> Result<()> {
    for (id, value) in other {
        if base.contains_key(&id) {
            return Err(BifrostError::Config(format!(
                "duplicate id '{}' in section '{}'",
                id, section
            )));
        }
        base.insert(id, value);
    }
    Ok(())
}

/// Whether a host should go through DNS resolution: IP literals and local
/// names are dialed directly.
pub fn allow_dns(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return false;
    }
    host != "localhost" && host != "[::1]"
}

/// Configuration provider settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// File provider configuration
    #[serde(default)]
    pub file: FileProviderOptions,
}

/// File-based configuration provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileProviderOptions {
    /// Whether additional files are merged into the main document
    #[serde(default)]
    pub enabled: bool,

    /// Paths (files or directories) to merge
    #[serde(default)]
    pub paths: Vec<String>,

    /// Watch for file changes and hot-reload
    #[serde(default)]
    pub watch: bool,
}

/// Distributed tracing options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingOptions {
    /// Enable the tracing server middleware and client propagation
    #[serde(default)]
    pub enabled: bool,
}

/// Metrics exposition options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsOptions {
    /// Prometheus tracer
    #[serde(default)]
    pub prometheus: PrometheusOptions,
}

/// Prometheus tracer options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrometheusOptions {
    /// Enable the Prometheus tracer
    #[serde(default)]
    pub enabled: bool,

    /// Histogram buckets for request duration, in seconds
    #[serde(default)]
    pub buckets: Vec<f64>,
}

/// Process logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output path; stderr when unset
    #[serde(default)]
    pub output: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
servers:
  apiv1:
    bind: "127.0.0.1:8001"

routes:
  all:
    paths: ["/"]
    service_id: backend

services:
  backend:
    url: http://127.0.0.1:8000
"#
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let opts = Options::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(opts.servers["apiv1"].bind, "127.0.0.1:8001");
        assert_eq!(opts.routes["all"].service_id, "backend");
        assert_eq!(opts.services["backend"].url, "http://127.0.0.1:8000");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
servers:
  apiv1:
    bind: "0.0.0.0:8001"
    http2: true
    access_log_id: main
    middlewares: [strip]
    timeout:
      idle_secs: 60
      graceful_secs: 10

routes:
  api:
    paths: ["/api"]
    methods: [GET, POST]
    host: api.example.com
    middlewares: [strip]
    service_id: backend

services:
  backend:
    url: http://cluster1
    protocol: http
    tls_verify: false
    timeout:
      connect_ms: 500
      read_ms: 3000

upstreams:
  cluster1:
    strategy: weighted
    targets:
      - target: "10.0.0.1:8000"
        weight: 2
      - target: "10.0.0.2:8000"
        weight: 1

middlewares:
  strip:
    type: strip_prefix
    params:
      prefixes: ["/api"]

access_logs:
  main:
    output: "./logs/access.log"
    template: "$time $remote_addr $request_method $request_uri $status"
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.upstreams["cluster1"].targets.len(), 2);
        assert_eq!(opts.middlewares["strip"].kind, "strip_prefix");
        assert!(opts.access_logs["main"].enabled);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[servers.apiv1]
bind = "127.0.0.1:8001"

[routes.all]
paths = ["/"]
service_id = "backend"

[services.backend]
url = "http://127.0.0.1:8000"
"#;
        let opts = Options::from_toml(toml).unwrap();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(Options::from_yaml(":: not yaml ::").is_err());
    }

    #[test]
    fn test_validate_duplicate_bind() {
        let yaml = r#"
servers:
  a:
    bind: "127.0.0.1:8001"
  b:
    bind: "127.0.0.1:8001"
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("share bind"));
    }

    #[test]
    fn test_validate_unknown_service() {
        let yaml = r#"
routes:
  r:
    paths: ["/"]
    service_id: nope
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[test]
    fn test_validate_unknown_middleware() {
        let yaml = r#"
servers:
  a:
    bind: "127.0.0.1:8001"
    middlewares: [ghost]
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("unknown middleware"));
    }

    #[test]
    fn test_validate_access_log_refs() {
        let yaml = r#"
servers:
  a:
    bind: "127.0.0.1:8001"
    access_log_id: missing
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        assert!(opts
            .validate()
            .unwrap_err()
            .to_string()
            .contains("unknown access log"));

        let yaml = r#"
servers:
  a:
    bind: "127.0.0.1:8001"
    access_log_id: off
access_logs:
  off:
    enabled: false
    output: "./x.log"
    template: "$status"
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        assert!(opts
            .validate()
            .unwrap_err()
            .to_string()
            .contains("disabled access log"));
    }

    #[test]
    fn test_validate_weighted_zero_weight() {
        let yaml = r#"
upstreams:
  u:
    strategy: weighted
    targets:
      - target: "10.0.0.1:80"
        weight: 0
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("weight can't be 0"));
    }

    #[test]
    fn test_validate_hashing_requires_hash_on() {
        let yaml = r#"
upstreams:
  u:
    strategy: hashing
    targets:
      - target: "10.0.0.1:80"
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("hash_on"));
    }

    #[test]
    fn test_validate_empty_targets() {
        let yaml = r#"
upstreams:
  u:
    targets: []
"#;
        let opts = Options::from_yaml(yaml).unwrap();
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("no targets"));
    }

    #[test]
    fn test_merge_adds_sections() {
        let mut base = Options::from_yaml(minimal_yaml()).unwrap();
        let extra = Options::from_yaml(
            r#"
services:
  other:
    url: http://127.0.0.1:9000
"#,
        )
        .unwrap();
        base.merge(extra).unwrap();
        assert_eq!(base.services.len(), 2);
    }

    #[test]
    fn test_merge_duplicate_id_is_error() {
        let mut base = Options::from_yaml(minimal_yaml()).unwrap();
        let extra = Options::from_yaml(
            r#"
services:
  backend:
    url: http://127.0.0.1:9000
"#,
        )
        .unwrap();
        let err = base.merge(extra).unwrap_err();
        assert!(err.to_string().contains("duplicate id"));
    }

    #[test]
    fn test_allow_dns() {
        assert!(!allow_dns("127.0.0.1"));
        assert!(!allow_dns("::1"));
        assert!(!allow_dns("localhost"));
        assert!(!allow_dns("[::1]"));
        assert!(allow_dns("backend.internal"));
        assert!(allow_dns("example.com"));
    }

    #[test]
    fn test_from_file_detects_format() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("bifrost.yaml");
        std::fs::write(&yaml_path, minimal_yaml()).unwrap();
        let opts = Options::from_file(&yaml_path).unwrap();
        assert_eq!(opts.servers.len(), 1);

        let toml_path = dir.path().join("bifrost.toml");
        std::fs::write(&toml_path, "[servers.a]\nbind = \"127.0.0.1:1\"\n").unwrap();
        let opts = Options::from_file(&toml_path).unwrap();
        assert_eq!(opts.servers["a"].bind, "127.0.0.1:1");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let opts = Options::from_yaml(minimal_yaml()).unwrap();
        let yaml = serde_yaml::to_string(&opts).unwrap();
        let parsed = Options::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.servers.len(), opts.servers.len());
    }
}
