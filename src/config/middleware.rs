//! Middleware configuration — kind plus free-form parameters

use serde::{Deserialize, Serialize};

/// Middleware configuration
///
/// `kind` names a constructor in the middleware factory; `params` is handed
/// to that constructor untouched, so embedder-registered middlewares can
/// define their own parameter shapes.
///
/// # Example
///
/// ```yaml
/// middlewares:
///   strip_api:
///     type: strip_prefix
///     params:
///       prefixes: ["/api"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareOptions {
    /// Middleware kind identifier
    #[serde(rename = "type")]
    pub kind: String,

    /// Kind-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,
}
