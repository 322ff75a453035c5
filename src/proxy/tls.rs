//! TLS termination — rustls-based server configuration
//!
//! Builds the acceptor for HTTPS servers. Suite preferences: TLS 1.2/1.3,
//! X25519 and P-256 key exchange, CHACHA20-POLY1305 and AES-GCM suites.

use crate::config::TlsOptions;
use crate::error::{BifrostError, Result};
use rustls::crypto::aws_lc_rs;
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from configuration
pub fn build_tls_acceptor(opts: &TlsOptions, http2: bool) -> Result<TlsAcceptor> {
    let server_config = build_server_config(opts, http2)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Build a rustls ServerConfig from certificate and key files
fn build_server_config(opts: &TlsOptions, http2: bool) -> Result<ServerConfig> {
    let cert_path = Path::new(&opts.cert_file);
    let key_path = Path::new(&opts.key_file);

    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        BifrostError::Tls(format!(
            "Failed to open certificate file {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BifrostError::Tls(format!("Failed to parse certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(BifrostError::Tls(
            "No certificates found in certificate file".to_string(),
        ));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        BifrostError::Tls(format!(
            "Failed to open key file {}: {}",
            key_path.display(),
            e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| BifrostError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| BifrostError::Tls("No private key found in key file".to_string()))?;

    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: vec![
            aws_lc_rs::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256,
            aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ],
        kx_groups: vec![aws_lc_rs::kx_group::X25519, aws_lc_rs::kx_group::SECP256R1],
        ..aws_lc_rs::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| BifrostError::Tls(format!("TLS protocol configuration error: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BifrostError::Tls(format!("TLS configuration error: {}", e)))?;

    config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(config)
}
