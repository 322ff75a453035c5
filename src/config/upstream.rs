//! Upstream configuration — target pools and balancing strategies

use serde::{Deserialize, Serialize};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Rotate through targets with an atomic counter
    #[default]
    RoundRobin,
    /// Distribute proportionally to target weights
    Weighted,
    /// Uniform random target
    Random,
    /// Consistent selection by a hash of the `hash_on` variable
    Hashing,
}

/// Upstream configuration — a named pool of targets
///
/// # Example
///
/// ```yaml
/// upstreams:
///   orders_cluster:
///     strategy: weighted
///     targets:
///       - target: "10.0.0.1:8000"
///         weight: 2
///       - target: "10.0.0.2:8000"
///         weight: 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamOptions {
    /// Balancing strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Variable name whose value keys the hashing strategy
    #[serde(default)]
    pub hash_on: Option<String>,

    /// Ordered target list
    pub targets: Vec<TargetOptions>,
}

/// A single upstream target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Endpoint, "host:port" or bare host
    pub target: String,

    /// Weight for the weighted strategy
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl TargetOptions {
    /// Split the target into host and optional port
    pub fn host_port(&self) -> (&str, Option<u16>) {
        if self.target.starts_with('[') {
            if let Some(end) = self.target.find(']') {
                let host = &self.target[..=end];
                let port = self.target[end + 1..]
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok());
                return (host, port);
            }
        }
        match self.target.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(p) => (host, Some(p)),
                Err(_) => (self.target.as_str(), None),
            },
            None => (self.target.as_str(), None),
        }
    }
}
