//! Centralized error types for Bifrost

use thiserror::Error;

/// Bifrost error types
#[derive(Debug, Error)]
pub enum BifrostError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// DNS lookup for an upstream or service host failed at load time
    #[error("DNS lookup failed for '{host}': {reason}")]
    DnsLookup { host: String, reason: String },

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP request or response error from the pooled client
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Middleware construction or execution failed
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// Protocol upgrade failed
    #[error("Upgrade error: {0}")]
    Upgrade(String),

    /// Zero-downtime handoff failure
    #[error("Zero-downtime error: {0}")]
    Zero(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, BifrostError>;
