//! Redis-backed rate limiting — fixed window via an atomic Lua script
//!
//! Counts requests per namespace key in Redis so the limit holds across
//! gateway instances. Fails open on Redis errors: the request is allowed
//! with the full quota reported.

use crate::ctx::RequestContext;
use crate::engine::Handler;
use crate::error::{BifrostError, Result};
use crate::vars::{self, Segment};
use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Atomic fixed-window counter.
///
/// KEYS[1] = namespace key, ARGV[1] = tokens, ARGV[2] = limit,
/// ARGV[3] = window seconds, ARGV[4] = now (ms).
/// Returns {current, limit, remaining, reset_ms}.
const WINDOW_LUA: &str = r#"
local key = KEYS[1]
local tokens = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local current = redis.call("INCRBY", key, tokens)
local ttl = redis.call("TTL", key)

if ttl == -1 then
    redis.call("EXPIRE", key, window)
    ttl = window
end

local reset = now + ttl * 1000
local remaining = limit - current
if remaining < 0 then
    remaining = 0
end

return {current, limit, remaining, reset}
"#;

#[derive(Debug, Deserialize)]
struct Params {
    redis_url: String,
    limit: u64,
    window_secs: u64,
    /// Namespace template, rendered per request (e.g. "rate:$client_ip")
    #[serde(default = "default_key")]
    key: String,
}

fn default_key() -> String {
    "bifrost:rate_limit:$client_ip".to_string()
}

/// The outcome of one window check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowResult {
    pub allow: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_ms: i64,
}

/// Redis-backed rate limiter middleware
pub struct RateLimitMiddleware {
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
    redis_url: String,
    limit: u64,
    window_secs: u64,
    key_segments: Vec<Segment>,
}

impl RateLimitMiddleware {
    pub fn new(params: &serde_json::Value) -> Result<Self> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| BifrostError::Middleware(format!("rate_limit: invalid params: {}", e)))?;
        if params.redis_url.is_empty() {
            return Err(BifrostError::Middleware(
                "rate_limit: redis_url can't be empty".into(),
            ));
        }
        if params.limit == 0 || params.window_secs == 0 {
            return Err(BifrostError::Middleware(
                "rate_limit: limit and window_secs must be positive".into(),
            ));
        }
        Ok(Self {
            connection: Arc::new(Mutex::new(None)),
            redis_url: params.redis_url,
            limit: params.limit,
            window_secs: params.window_secs,
            key_segments: vars::parse_template(&params.key),
        })
    }

    fn namespace(&self, ctx: &RequestContext) -> String {
        let mut key = String::new();
        for segment in &self.key_segments {
            match segment {
                Segment::Literal(s) => key.push_str(s),
                Segment::Var(name) => key.push_str(&vars::get(name, ctx).unwrap_or_default()),
            }
        }
        key
    }

    async fn get_connection(
        &self,
    ) -> std::result::Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let client = redis::Client::open(self.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Check the window for one namespace. Fails open on Redis errors.
    pub async fn allow(&self, namespace: &str) -> AllowResult {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let fail_open = AllowResult {
            allow: true,
            limit: self.limit,
            remaining: self.limit,
            reset_ms: now_ms + (self.window_secs as i64) * 1000,
        };

        let mut conn = match self.get_connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, redis_url = %self.redis_url,
                    "rate_limit: redis unavailable, failing open");
                return fail_open;
            }
        };

        let result: std::result::Result<Vec<i64>, redis::RedisError> =
            redis::Script::new(WINDOW_LUA)
                .key(namespace)
                .arg(1u64)
                .arg(self.limit)
                .arg(self.window_secs)
                .arg(now_ms)
                .invoke_async(&mut conn)
                .await;

        match result {
            Ok(values) if values.len() == 4 => AllowResult {
                allow: (values[0] as u64) <= self.limit,
                limit: values[1] as u64,
                remaining: values[2] as u64,
                reset_ms: values[3],
            },
            Ok(_) | Err(_) => {
                tracing::warn!("rate_limit: redis eval failed, failing open");
                fail_open
            }
        }
    }
}

#[async_trait]
impl Handler for RateLimitMiddleware {
    async fn handle(&self, ctx: &mut RequestContext) {
        let namespace = self.namespace(ctx);
        let result = self.allow(&namespace).await;

        let headers = ctx.resp_headers_mut();
        headers.insert("X-RateLimit-Limit", result.limit.into());
        headers.insert("X-RateLimit-Remaining", result.remaining.into());
        headers.insert("X-RateLimit-Reset", (result.reset_ms / 1000).into());

        if !result.allow {
            ctx.respond(StatusCode::TOO_MANY_REQUESTS, "");
            ctx.abort();
        }
    }
}
