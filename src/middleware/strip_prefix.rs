//! Strip prefix middleware — remove path prefixes before forwarding

use crate::ctx::RequestContext;
use crate::engine::Handler;
use crate::error::{BifrostError, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Params {
    prefixes: Vec<String>,
}

/// Strip prefix middleware — first matching prefix wins
pub struct StripPrefixMiddleware {
    prefixes: Vec<String>,
}

impl StripPrefixMiddleware {
    pub fn new(params: &serde_json::Value) -> Result<Self> {
        let params: Params = serde_json::from_value(params.clone()).map_err(|e| {
            BifrostError::Middleware(format!("strip_prefix: invalid params: {}", e))
        })?;
        Ok(Self {
            prefixes: params.prefixes,
        })
    }
}

#[async_trait]
impl Handler for StripPrefixMiddleware {
    async fn handle(&self, ctx: &mut RequestContext) {
        let path = ctx.path().to_string();
        for prefix in &self.prefixes {
            if let Some(stripped) = path.strip_prefix(prefix.as_str()) {
                let new_path = if stripped.is_empty() || !stripped.starts_with('/') {
                    format!("/{}", stripped)
                } else {
                    stripped.to_string()
                };
                ctx.set_path(&new_path);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn make(prefixes: &[&str]) -> StripPrefixMiddleware {
        StripPrefixMiddleware::new(&serde_json::json!({ "prefixes": prefixes })).unwrap()
    }

    fn test_ctx(uri: &str) -> RequestContext {
        let (head, _) = http::Request::builder()
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts();
        RequestContext::new(
            head,
            Bytes::new(),
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_strip_prefix() {
        let mw = make(&["/api/v1"]);
        let mut ctx = test_ctx("/api/v1/users");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/users");
    }

    #[tokio::test]
    async fn test_strip_prefix_exact() {
        let mw = make(&["/api"]);
        let mut ctx = test_ctx("/api");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/");
    }

    #[tokio::test]
    async fn test_strip_prefix_no_match() {
        let mw = make(&["/api"]);
        let mut ctx = test_ctx("/other/path");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/other/path");
    }

    #[tokio::test]
    async fn test_strip_prefix_preserves_query() {
        let mw = make(&["/api"]);
        let mut ctx = test_ctx("/api/users?page=1");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/users");
        assert_eq!(ctx.query(), Some("page=1"));
    }

    #[tokio::test]
    async fn test_strip_prefix_first_match_wins() {
        let mw = make(&["/api", "/api/v1"]);
        let mut ctx = test_ctx("/api/v1/users");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/v1/users");
    }

    #[test]
    fn test_invalid_params() {
        assert!(StripPrefixMiddleware::new(&serde_json::json!({"prefixes": "nope"})).is_err());
        assert!(StripPrefixMiddleware::new(&serde_json::Value::Null).is_err());
    }
}
