//! Server configuration — listeners and their engines

use serde::{Deserialize, Serialize};

/// Server configuration — one listener plus an engine
///
/// # Example
///
/// ```yaml
/// servers:
///   apiv1:
///     bind: "0.0.0.0:8001"
///     http2: true
///     access_log_id: main
///     middlewares: [request_id]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Listen address, e.g. "0.0.0.0:8001"
    pub bind: String,

    /// Set SO_REUSEPORT on the listener
    #[serde(default)]
    pub reuse_port: bool,

    /// Enable HTTP/2 (ALPN h2 with TLS, H2C on cleartext)
    #[serde(default)]
    pub http2: bool,

    /// TLS material; the server terminates TLS when present
    #[serde(default)]
    pub tls: Option<TlsOptions>,

    /// Server-level timeouts
    #[serde(default)]
    pub timeout: ServerTimeoutOptions,

    /// Access log id for this server
    #[serde(default)]
    pub access_log_id: Option<String>,

    /// Entry middleware ids, applied before routing
    #[serde(default)]
    pub middlewares: Vec<String>,
}

/// TLS certificate material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Path to the PEM certificate chain
    pub cert_file: String,
    /// Path to the PEM private key
    pub key_file: String,
}

/// Server-level timeouts, in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTimeoutOptions {
    /// Idle connection timeout
    #[serde(default)]
    pub idle_secs: Option<u64>,

    /// Keep-alive timeout
    #[serde(default)]
    pub keep_alive_secs: Option<u64>,

    /// Read timeout (request head)
    #[serde(default)]
    pub read_secs: Option<u64>,

    /// Write timeout
    #[serde(default)]
    pub write_secs: Option<u64>,

    /// Graceful shutdown drain window
    #[serde(default)]
    pub graceful_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_options_defaults() {
        let yaml = r#"
bind: "127.0.0.1:8001"
"#;
        let opts: ServerOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.bind, "127.0.0.1:8001");
        assert!(!opts.http2);
        assert!(!opts.reuse_port);
        assert!(opts.tls.is_none());
        assert!(opts.middlewares.is_empty());
        assert!(opts.timeout.graceful_secs.is_none());
    }

    #[test]
    fn test_server_options_full() {
        let yaml = r#"
bind: "0.0.0.0:443"
http2: true
reuse_port: true
tls:
  cert_file: /etc/certs/cert.pem
  key_file: /etc/certs/key.pem
timeout:
  idle_secs: 120
  keep_alive_secs: 60
  graceful_secs: 10
access_log_id: main
middlewares: [a, b]
"#;
        let opts: ServerOptions = serde_yaml::from_str(yaml).unwrap();
        assert!(opts.http2);
        assert!(opts.reuse_port);
        assert_eq!(opts.tls.unwrap().cert_file, "/etc/certs/cert.pem");
        assert_eq!(opts.timeout.idle_secs, Some(120));
        assert_eq!(opts.access_log_id.as_deref(), Some("main"));
        assert_eq!(opts.middlewares, vec!["a", "b"]);
    }
}
