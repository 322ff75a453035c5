//! Middleware — composable request transformations and the kind factory
//!
//! Middlewares are plain [`Handler`]s. Each configured middleware names a
//! kind; the factory maps kinds to constructors. Embedders register their
//! own kinds with [`register_middleware`] before loading configuration;
//! after process start the map is read-only.

mod add_prefix;
mod rate_limit;
mod replace_path_regex;
mod strip_prefix;

pub use add_prefix::AddPrefixMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use replace_path_regex::ReplacePathRegexMiddleware;
pub use strip_prefix::StripPrefixMiddleware;

use crate::config::MiddlewareOptions;
use crate::ctx::{RequestContext, VarValue};
use crate::engine::Handler;
use crate::error::{BifrostError, Result};
use crate::vars;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Constructor for one middleware kind
pub type MiddlewareFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Handler>> + Send + Sync>;

static FACTORY: Lazy<RwLock<HashMap<String, MiddlewareFactory>>> = Lazy::new(|| {
    let mut map: HashMap<String, MiddlewareFactory> = HashMap::new();
    map.insert(
        "strip_prefix".to_string(),
        Arc::new(|params: &serde_json::Value| {
            Ok(Arc::new(StripPrefixMiddleware::new(params)?) as Arc<dyn Handler>)
        }),
    );
    map.insert(
        "add_prefix".to_string(),
        Arc::new(|params: &serde_json::Value| {
            Ok(Arc::new(AddPrefixMiddleware::new(params)?) as Arc<dyn Handler>)
        }),
    );
    map.insert(
        "replace_path_regex".to_string(),
        Arc::new(|params: &serde_json::Value| {
            Ok(Arc::new(ReplacePathRegexMiddleware::new(params)?) as Arc<dyn Handler>)
        }),
    );
    map.insert(
        "rate_limit".to_string(),
        Arc::new(|params: &serde_json::Value| {
            Ok(Arc::new(RateLimitMiddleware::new(params)?) as Arc<dyn Handler>)
        }),
    );
    RwLock::new(map)
});

/// Register an embedder-defined middleware kind. Must be called before
/// configuration load; duplicate kinds are rejected.
pub fn register_middleware(kind: &str, factory: MiddlewareFactory) -> Result<()> {
    if kind.is_empty() {
        return Err(BifrostError::Middleware(
            "middleware kind can't be empty".into(),
        ));
    }
    let mut map = FACTORY.write().unwrap();
    if map.contains_key(kind) {
        return Err(BifrostError::Middleware(format!(
            "middleware kind '{}' is already registered",
            kind
        )));
    }
    map.insert(kind.to_string(), factory);
    Ok(())
}

/// Construct one middleware from its kind and parameters
pub fn build_middleware(kind: &str, params: &serde_json::Value) -> Result<Arc<dyn Handler>> {
    let factory = {
        let map = FACTORY.read().unwrap();
        map.get(kind).cloned()
    };
    match factory {
        Some(f) => f(params),
        None => Err(BifrostError::Middleware(format!(
            "middleware kind '{}' was not found",
            kind
        ))),
    }
}

/// Construct every configured middleware, keyed by id
pub fn load_middlewares(
    configs: &HashMap<String, MiddlewareOptions>,
) -> Result<HashMap<String, Arc<dyn Handler>>> {
    let mut loaded = HashMap::new();
    for (id, opts) in configs {
        if opts.kind.is_empty() {
            return Err(BifrostError::Middleware(format!(
                "middleware '{}' has no kind",
                id
            )));
        }
        let handler = build_middleware(&opts.kind, &opts.params)
            .map_err(|e| BifrostError::Middleware(format!("middleware '{}': {}", id, e)))?;
        loaded.insert(id.clone(), handler);
    }
    Ok(loaded)
}

/// Init middleware — first in every chain.
///
/// Stamps the server id, a fresh trace id, the client IP resolver and the
/// request start time into the context.
pub struct InitMiddleware {
    server_id: String,
}

impl InitMiddleware {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

#[async_trait]
impl Handler for InitMiddleware {
    async fn handle(&self, ctx: &mut RequestContext) {
        ctx.set_str(vars::SERVER_ID, self.server_id.as_str());

        if ctx.get_str(vars::TRACE_ID).is_none() {
            let trace_id = uuid::Uuid::new_v4().simple().to_string();
            ctx.set_str(vars::TRACE_ID, trace_id);
        }

        // The tracer may have recorded the start already
        if ctx.get_time(vars::TIME).is_none() {
            ctx.set(vars::TIME, VarValue::Time(chrono::Utc::now()));
        }

        ctx.set_client_ip_fn(Arc::new(|c: &RequestContext| {
            c.remote_addr.ip().to_string()
        }));

        tracing::debug!(
            server_id = %self.server_id,
            trace_id = ctx.get_str(vars::TRACE_ID).unwrap_or(""),
            uri = %ctx.full_uri(),
            "request accepted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    fn test_ctx(uri: &str) -> RequestContext {
        let (head, _) = http::Request::builder()
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts();
        RequestContext::new(
            head,
            Bytes::new(),
            "10.0.0.9:4000".parse().unwrap(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_build_known_kind() {
        let params = serde_json::json!({"prefixes": ["/api"]});
        assert!(build_middleware("strip_prefix", &params).is_ok());
    }

    #[test]
    fn test_build_unknown_kind() {
        let err = match build_middleware("nope", &serde_json::Value::Null) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("was not found"));
    }

    #[test]
    fn test_register_custom_kind() {
        struct Nop;
        #[async_trait]
        impl Handler for Nop {
            async fn handle(&self, _ctx: &mut RequestContext) {}
        }

        register_middleware(
            "test_custom_kind",
            Arc::new(|_: &serde_json::Value| Ok(Arc::new(Nop) as Arc<dyn Handler>)),
        )
        .unwrap();
        assert!(build_middleware("test_custom_kind", &serde_json::Value::Null).is_ok());

        // Second registration of the same kind fails
        let err = register_middleware(
            "test_custom_kind",
            Arc::new(|_: &serde_json::Value| Ok(Arc::new(Nop) as Arc<dyn Handler>)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_register_empty_kind() {
        struct Nop;
        #[async_trait]
        impl Handler for Nop {
            async fn handle(&self, _ctx: &mut RequestContext) {}
        }
        assert!(register_middleware(
            "",
            Arc::new(|_: &serde_json::Value| Ok(Arc::new(Nop) as Arc<dyn Handler>))
        )
        .is_err());
    }

    #[test]
    fn test_load_middlewares() {
        let mut configs = HashMap::new();
        configs.insert(
            "strip".to_string(),
            MiddlewareOptions {
                kind: "strip_prefix".to_string(),
                params: serde_json::json!({"prefixes": ["/api"]}),
            },
        );
        let loaded = load_middlewares(&configs).unwrap();
        assert!(loaded.contains_key("strip"));
    }

    #[test]
    fn test_load_middlewares_unknown_kind() {
        let mut configs = HashMap::new();
        configs.insert(
            "bad".to_string(),
            MiddlewareOptions {
                kind: "ghost".to_string(),
                params: serde_json::Value::Null,
            },
        );
        let err = match load_middlewares(&configs) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test]
    async fn test_init_middleware_stamps_context() {
        let mw = InitMiddleware::new("apiv1");
        let mut ctx = test_ctx("/x");
        mw.handle(&mut ctx).await;

        assert_eq!(ctx.get_str(vars::SERVER_ID), Some("apiv1"));
        assert_eq!(ctx.get_str(vars::TRACE_ID).unwrap().len(), 32);
        assert!(ctx.get_time(vars::TIME).is_some());
        assert_eq!(ctx.client_ip(), "10.0.0.9");
    }

    #[tokio::test]
    async fn test_init_middleware_keeps_existing_time() {
        let mw = InitMiddleware::new("apiv1");
        let mut ctx = test_ctx("/x");
        let earlier = chrono::Utc::now() - chrono::Duration::seconds(5);
        ctx.set(vars::TIME, VarValue::Time(earlier));
        mw.handle(&mut ctx).await;
        assert_eq!(ctx.get_time(vars::TIME), Some(earlier));
    }
}
