//! Replace-path-regex middleware — regex path rewrite

use crate::ctx::RequestContext;
use crate::engine::Handler;
use crate::error::{BifrostError, Result};
use crate::vars;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Params {
    regex: String,
    replacement: String,
}

/// Replace-path-regex middleware
///
/// On match the path is rewritten, `X-Replaced-Path` carries the original
/// path, and the original path is always stored in the context under
/// `$request_path` so the access log can tell both apart.
pub struct ReplacePathRegexMiddleware {
    regex: Regex,
    replacement: String,
}

impl ReplacePathRegexMiddleware {
    pub fn new(params: &serde_json::Value) -> Result<Self> {
        let params: Params = serde_json::from_value(params.clone()).map_err(|e| {
            BifrostError::Middleware(format!("replace_path_regex: invalid params: {}", e))
        })?;
        let regex = Regex::new(&params.regex).map_err(|e| {
            BifrostError::Middleware(format!(
                "replace_path_regex: invalid regex '{}': {}",
                params.regex, e
            ))
        })?;
        Ok(Self {
            regex,
            replacement: params.replacement,
        })
    }
}

#[async_trait]
impl Handler for ReplacePathRegexMiddleware {
    async fn handle(&self, ctx: &mut RequestContext) {
        let original = ctx.path().to_string();
        ctx.set_str(vars::REQUEST_PATH, original.clone());

        if self.regex.is_match(&original) {
            let new_path = self
                .regex
                .replace(&original, self.replacement.as_str())
                .into_owned();
            ctx.set_path(&new_path);
            if let Ok(value) = http::HeaderValue::from_str(&original) {
                ctx.head.headers.insert("X-Replaced-Path", value.clone());
                ctx.resp.headers.insert("X-Replaced-Path", value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn make(regex: &str, replacement: &str) -> ReplacePathRegexMiddleware {
        ReplacePathRegexMiddleware::new(
            &serde_json::json!({"regex": regex, "replacement": replacement}),
        )
        .unwrap()
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
    async fn test_replace_path() {
        let mw = make("^/api(/v1.*)", "$1");
        let mut ctx = test_ctx("/api/v1/users");
        mw.handle(&mut ctx).await;

        assert_eq!(ctx.path(), "/v1/users");
        assert_eq!(
            ctx.head.headers.get("X-Replaced-Path").unwrap(),
            "/api/v1/users"
        );
        assert_eq!(ctx.get_str(vars::REQUEST_PATH), Some("/api/v1/users"));
    }

    #[tokio::test]
    async fn test_no_replacement_needed() {
        let mw = make("^/api(/v2.*)", "$1");
        let mut ctx = test_ctx("/v1/users");
        mw.handle(&mut ctx).await;

        assert_eq!(ctx.path(), "/v1/users");
        assert!(ctx.head.headers.get("X-Replaced-Path").is_none());
        assert_eq!(ctx.get_str(vars::REQUEST_PATH), Some("/v1/users"));
    }

    #[tokio::test]
    async fn test_replace_preserves_query() {
        let mw = make("^/api/v1/(.*)$", "/hoo/$1");
        let mut ctx = test_ctx("/api/v1/users?name=john");
        mw.handle(&mut ctx).await;

        assert_eq!(ctx.path(), "/hoo/users");
        assert_eq!(ctx.query(), Some("name=john"));
        assert_eq!(
            ctx.resp.headers.get("X-Replaced-Path").unwrap(),
            "/api/v1/users"
        );
        assert_eq!(ctx.get_str(vars::REQUEST_PATH), Some("/api/v1/users"));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let result = ReplacePathRegexMiddleware::new(
            &serde_json::json!({"regex": "([", "replacement": "x"}),
        );
        assert!(result.is_err());
    }
}
