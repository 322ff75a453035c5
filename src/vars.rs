//! Variable directives — `$`-prefixed tokens resolved at request time
//!
//! Directives thread dynamic values (client IP, headers, trace id, upstream
//! name) through configuration: access-log templates, `hash_on` keys and
//! dynamic upstream bindings all name variables from this set.

use crate::ctx::RequestContext;
use chrono::SecondsFormat;

pub const TIME: &str = "$time";
pub const REMOTE_ADDR: &str = "$remote_addr";
pub const CLIENT_IP: &str = "$client_ip";
pub const REQUEST_METHOD: &str = "$request_method";
pub const REQUEST_URI: &str = "$request_uri";
pub const REQUEST_PATH: &str = "$request_path";
pub const REQUEST_PROTOCOL: &str = "$request_protocol";
pub const REQUEST_BODY: &str = "$request_body";
pub const STATUS: &str = "$status";
pub const UPSTREAM: &str = "$upstream";
pub const UPSTREAM_ADDR: &str = "$upstream_addr";
pub const UPSTREAM_STATUS: &str = "$upstream_status";
pub const UPSTREAM_URI: &str = "$upstream_uri";
pub const UPSTREAM_PATH: &str = "$upstream_path";
pub const UPSTREAM_METHOD: &str = "$upstream_method";
pub const UPSTREAM_PROTOCOL: &str = "$upstream_protocol";
pub const UPSTREAM_RESPONSE_TIME: &str = "$upstream_response_time";
pub const DURATION: &str = "$duration";
pub const TRACE_ID: &str = "$trace_id";
pub const SERVER_ID: &str = "$server_id";
pub const CLIENT_CANCELED_AT: &str = "$client_canceled_at";
pub const TARGET_TIMEOUT: &str = "$target_timeout";

const VAR_PREFIX: &str = "$var.";
const HEADER_PREFIX: &str = "$header_";
const UPSTREAM_HEADER_PREFIX: &str = "$upstream_header_";

/// Resolve a directive against the request context. Unknown names yield None.
pub fn get(name: &str, ctx: &RequestContext) -> Option<String> {
    match name {
        TIME => ctx
            .get_time(TIME)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        REMOTE_ADDR => Some(ctx.remote_addr.ip().to_string()),
        CLIENT_IP => Some(ctx.client_ip()),
        REQUEST_METHOD | UPSTREAM_METHOD => Some(ctx.method().as_str().to_string()),
        // The rewritten path, as sent upstream
        REQUEST_URI | UPSTREAM_URI => Some(match ctx.query() {
            Some(q) => format!("{}?{}", ctx.path(), q),
            None => ctx.path().to_string(),
        }),
        // The original client path when a rewrite middleware stored it
        REQUEST_PATH => Some(
            ctx.get_str(REQUEST_PATH)
                .map(str::to_string)
                .unwrap_or_else(|| ctx.path().to_string()),
        ),
        UPSTREAM_PATH => Some(ctx.path().to_string()),
        REQUEST_PROTOCOL | UPSTREAM_PROTOCOL => Some(ctx.protocol().to_string()),
        REQUEST_BODY => Some(String::from_utf8_lossy(&ctx.body).into_owned()),
        STATUS => Some(ctx.status().as_u16().to_string()),
        UPSTREAM => ctx.get_str(UPSTREAM).map(str::to_string),
        UPSTREAM_ADDR => ctx.get_str(UPSTREAM_ADDR).map(str::to_string),
        UPSTREAM_STATUS => ctx.get_str(UPSTREAM_STATUS).map(str::to_string),
        UPSTREAM_RESPONSE_TIME => ctx.get_str(UPSTREAM_RESPONSE_TIME).map(str::to_string),
        DURATION => ctx.get_time(TIME).map(|start| {
            let micros = (chrono::Utc::now() - start).num_microseconds().unwrap_or(0);
            format_seconds(micros)
        }),
        TRACE_ID => ctx.get_str(TRACE_ID).map(str::to_string),
        SERVER_ID => ctx.get_str(SERVER_ID).map(str::to_string),
        CLIENT_CANCELED_AT => ctx
            .get_time(CLIENT_CANCELED_AT)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        "" => None,
        _ => {
            if let Some(var) = name.strip_prefix(VAR_PREFIX) {
                return ctx.get_str(var).map(str::to_string);
            }
            if let Some(header) = name.strip_prefix(UPSTREAM_HEADER_PREFIX) {
                return ctx
                    .resp
                    .headers
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
            }
            if let Some(header) = name.strip_prefix(HEADER_PREFIX) {
                // Trusted-proxy semantics: the context records the appended
                // chain, the raw header only what the client claimed.
                if header == "X-Forwarded-For" {
                    return Some(
                        ctx.get_str("X-Forwarded-For")
                            .map(str::to_string)
                            .unwrap_or_default(),
                    );
                }
                return ctx
                    .head
                    .headers
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
            }
            None
        }
    }
}

/// Format microseconds as fractional seconds with microsecond precision,
/// trailing zeros trimmed.
pub fn format_seconds(micros: i64) -> String {
    let s = format!("{:.6}", micros as f64 / 1e6);
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether a name is a recognized directive. Templates render unknown
/// tokens verbatim but recognized-yet-unset directives as empty.
pub fn is_directive(name: &str) -> bool {
    matches!(
        name,
        TIME | REMOTE_ADDR
            | CLIENT_IP
            | REQUEST_METHOD
            | REQUEST_URI
            | REQUEST_PATH
            | REQUEST_PROTOCOL
            | REQUEST_BODY
            | STATUS
            | UPSTREAM
            | UPSTREAM_ADDR
            | UPSTREAM_STATUS
            | UPSTREAM_URI
            | UPSTREAM_PATH
            | UPSTREAM_METHOD
            | UPSTREAM_PROTOCOL
            | UPSTREAM_RESPONSE_TIME
            | DURATION
            | TRACE_ID
            | SERVER_ID
            | CLIENT_CANCELED_AT
    ) || name.starts_with(VAR_PREFIX)
        || name.starts_with(HEADER_PREFIX)
        || name.starts_with(UPSTREAM_HEADER_PREFIX)
}

/// One segment of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Var(String),
}

/// Parse a template into literal and variable segments. A variable is `$`
/// followed by alphanumerics, `_`, `.` or `-`.
pub fn parse_template(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        let (before, after) = rest.split_at(pos);
        literal.push_str(before);
        let name_len = after[1..]
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.' || *b == b'-')
            .count();
        if name_len > 0 {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Var(after[..1 + name_len].to_string()));
            rest = &after[1 + name_len..];
        } else {
            literal.push('$');
            rest = &after[1..];
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}
