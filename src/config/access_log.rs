//! Access log configuration — template-driven request logging

use serde::{Deserialize, Serialize};

/// Escape mode applied to variable values in the rendered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escape {
    /// `\xHH` for control and non-printable bytes
    #[default]
    Default,
    /// JSON string escaping
    Json,
    /// No escaping
    None,
}

/// Access log configuration
///
/// # Example
///
/// ```yaml
/// access_logs:
///   main:
///     output: "./logs/access.log"
///     template: >
///       $time $remote_addr $request_method $request_uri
///       $status $upstream_addr $upstream_response_time $duration
///     escape: json
///     flush_secs: 1
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogOptions {
    /// Whether this log is active
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Output file path
    pub output: String,

    /// Template string with `$variables`
    pub template: String,

    /// Escape mode for substituted values
    #[serde(default)]
    pub escape: Escape,

    /// strftime-style format for `$time`; RFC 3339 when unset
    #[serde(default)]
    pub time_format: Option<String>,

    /// Flush interval for the buffered writer, in seconds
    #[serde(default = "default_flush_secs")]
    pub flush_secs: u64,

    /// Writer buffer size, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_flush_secs() -> u64 {
    1
}

fn default_buffer_size() -> usize {
    64 * 1024
}
