//! Add prefix middleware — prepend a literal prefix to the path

use crate::ctx::RequestContext;
use crate::engine::Handler;
use crate::error::{BifrostError, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Params {
    prefix: String,
}

/// Add prefix middleware
pub struct AddPrefixMiddleware {
    prefix: String,
}

impl AddPrefixMiddleware {
    pub fn new(params: &serde_json::Value) -> Result<Self> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| BifrostError::Middleware(format!("add_prefix: invalid params: {}", e)))?;
        if params.prefix.is_empty() {
            return Err(BifrostError::Middleware(
                "add_prefix: prefix can't be empty".into(),
            ));
        }
        Ok(Self {
            prefix: params.prefix,
        })
    }
}

#[async_trait]
impl Handler for AddPrefixMiddleware {
    async fn handle(&self, ctx: &mut RequestContext) {
        let new_path = if ctx.path() == "/" {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, ctx.path())
        };
        ctx.set_path(&new_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::StripPrefixMiddleware;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn make(prefix: &str) -> AddPrefixMiddleware {
        AddPrefixMiddleware::new(&serde_json::json!({ "prefix": prefix })).unwrap()
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
    async fn test_add_prefix() {
        let mw = make("/api");
        let mut ctx = test_ctx("/users");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/api/users");
    }

    #[tokio::test]
    async fn test_add_prefix_root() {
        let mw = make("/api");
        let mut ctx = test_ctx("/");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/api");
    }

    #[tokio::test]
    async fn test_add_prefix_preserves_query() {
        let mw = make("/v2");
        let mut ctx = test_ctx("/items?id=3");
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/v2/items");
        assert_eq!(ctx.query(), Some("id=3"));
    }

    #[tokio::test]
    async fn test_strip_then_add_is_identity() {
        let strip =
            StripPrefixMiddleware::new(&serde_json::json!({"prefixes": ["/api"]})).unwrap();
        let add = make("/api");

        let mut ctx = test_ctx("/api/orders?q=1");
        strip.handle(&mut ctx).await;
        add.handle(&mut ctx).await;
        assert_eq!(ctx.path(), "/api/orders");
        assert_eq!(ctx.query(), Some("q=1"));
    }

    #[test]
    fn test_empty_prefix_rejected() {
        assert!(AddPrefixMiddleware::new(&serde_json::json!({"prefix": ""})).is_err());
    }
}
