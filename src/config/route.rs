//! Route configuration — match predicates selecting a service

use serde::{Deserialize, Serialize};

/// Route configuration
///
/// Matching is static prefix-based over `paths`; when several routes share a
/// prefix, the longest literal match wins. `methods` is a set filter and
/// `host`, when set, must match the Host header exactly.
///
/// # Example
///
/// ```yaml
/// routes:
///   orders:
///     paths: ["/api/orders"]
///     methods: [GET, POST]
///     middlewares: [strip_api]
///     service_id: orders
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Literal path prefixes this route matches
    pub paths: Vec<String>,

    /// HTTP methods; empty matches all
    #[serde(default)]
    pub methods: Vec<String>,

    /// Exact Host match; unset matches all hosts
    #[serde(default)]
    pub host: Option<String>,

    /// Route middleware ids, applied before the service's own
    #[serde(default)]
    pub middlewares: Vec<String>,

    /// Target service id
    pub service_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_options_defaults() {
        let yaml = r#"
paths: ["/api"]
service_id: backend
"#;
        let opts: RouteOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.paths, vec!["/api"]);
        assert!(opts.methods.is_empty());
        assert!(opts.host.is_none());
        assert!(opts.middlewares.is_empty());
        assert_eq!(opts.service_id, "backend");
    }

    #[test]
    fn test_route_options_full() {
        let yaml = r#"
paths: ["/api", "/v2/api"]
methods: [GET, DELETE]
host: api.example.com
middlewares: [auth]
service_id: backend
"#;
        let opts: RouteOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.paths.len(), 2);
        assert_eq!(opts.methods, vec!["GET", "DELETE"]);
        assert_eq!(opts.host.as_deref(), Some("api.example.com"));
    }
}
