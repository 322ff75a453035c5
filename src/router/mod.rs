//! Router — static prefix matching onto per-route handler chains
//!
//! Routes are compiled once per engine build. Matching is prefix-based:
//! entries are sorted by literal prefix length so the longest match wins;
//! the method filter is a set match and the host filter, when present,
//! must match exactly. Each route precomputes its tail chain
//! `[route-middlewares..., service-middlewares..., service-handler]`.

use crate::config::Options;
use crate::ctx::RequestContext;
use crate::engine::{Handler, HandlersChain};
use crate::error::{BifrostError, Result};
use crate::service::Service;
use async_trait::async_trait;
use http::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct CompiledRoute {
    route_id: String,
    prefix: String,
    methods: HashSet<String>,
    host: Option<String>,
    chain: Arc<HandlersChain>,
}

/// The router handler, installed as the tail of every engine chain
pub struct Router {
    routes: Vec<CompiledRoute>,
    not_found: Option<Arc<dyn Handler>>,
}

impl Router {
    /// Compile the route table from configuration
    pub fn new(
        options: &Options,
        services: &HashMap<String, Arc<Service>>,
        middlewares: &HashMap<String, Arc<dyn Handler>>,
    ) -> Result<Self> {
        let mut routes = Vec::new();

        for (route_id, route_opts) in &options.routes {
            let service = services.get(&route_opts.service_id).ok_or_else(|| {
                BifrostError::Config(format!(
                    "route '{}' references unknown service '{}'",
                    route_id, route_opts.service_id
                ))
            })?;
            let service_opts = &options.services[&route_opts.service_id];

            let mut chain: HandlersChain = Vec::new();
            for mw_id in &route_opts.middlewares {
                let handler = middlewares.get(mw_id).ok_or_else(|| {
                    BifrostError::Config(format!(
                        "middleware '{}' was not found in route '{}'",
                        mw_id, route_id
                    ))
                })?;
                chain.push(handler.clone());
            }
            for mw_id in &service_opts.middlewares {
                let handler = middlewares.get(mw_id).ok_or_else(|| {
                    BifrostError::Config(format!(
                        "middleware '{}' was not found in service '{}'",
                        mw_id, route_opts.service_id
                    ))
                })?;
                chain.push(handler.clone());
            }
            chain.push(service.clone() as Arc<dyn Handler>);
            let chain = Arc::new(chain);

            let methods: HashSet<String> = route_opts
                .methods
                .iter()
                .map(|m| m.to_uppercase())
                .collect();

            for prefix in &route_opts.paths {
                if prefix.is_empty() {
                    return Err(BifrostError::Config(format!(
                        "route '{}' has an empty path",
                        route_id
                    )));
                }
                routes.push(CompiledRoute {
                    route_id: route_id.clone(),
                    prefix: prefix.clone(),
                    methods: methods.clone(),
                    host: route_opts.host.clone(),
                    chain: chain.clone(),
                });
            }
        }

        // Longest literal prefix wins; route id breaks ties deterministically
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.route_id.cmp(&b.route_id))
        });

        Ok(Self {
            routes,
            not_found: None,
        })
    }

    /// Install a custom not-found handler
    pub fn set_not_found(&mut self, handler: Arc<dyn Handler>) {
        self.not_found = Some(handler);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn find(&self, method: &str, path: &str, host: Option<&str>) -> Option<&CompiledRoute> {
        self.routes.iter().find(|route| {
            if !path.starts_with(route.prefix.as_str()) {
                return false;
            }
            if !route.methods.is_empty() && !route.methods.contains(method) {
                return false;
            }
            match (&route.host, host) {
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
                (None, _) => true,
            }
        })
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, ctx: &mut RequestContext) {
        let method = ctx.method().as_str().to_string();
        let path = ctx.path().to_string();
        let host = ctx.host().map(str::to_string);

        match self.find(&method, &path, host.as_deref()) {
            Some(route) => {
                tracing::debug!(route_id = %route.route_id, path = %path, "route matched");
                let chain = route.chain.clone();
                ctx.run_chain(chain).await;
            }
            None => match &self.not_found {
                Some(handler) => handler.handle(ctx).await,
                None => {
                    ctx.respond(StatusCode::NOT_FOUND, "");
                    ctx.abort();
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    struct Marker(&'static str);

    #[async_trait]
    impl Handler for Marker {
        async fn handle(&self, ctx: &mut RequestContext) {
            ctx.set_str("matched", self.0);
            ctx.abort();
        }
    }

    fn test_ctx(method: &str, uri: &str, host: Option<&str>) -> RequestContext {
        let mut builder = http::Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        let (head, _) = builder.body(()).unwrap().into_parts();
        RequestContext::new(
            head,
            Bytes::new(),
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        )
    }

    /// Router with synthetic chains, bypassing service construction
    fn make_router(entries: Vec<(&'static str, &str, Vec<&str>, Option<&str>)>) -> Router {
        let mut routes = Vec::new();
        for (id, prefix, methods, host) in entries {
            let chain: Arc<HandlersChain> =
                Arc::new(vec![Arc::new(Marker(id)) as Arc<dyn Handler>]);
            routes.push(CompiledRoute {
                route_id: id.to_string(),
                prefix: prefix.to_string(),
                methods: methods.into_iter().map(str::to_string).collect(),
                host: host.map(str::to_string),
                chain,
            });
        }
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.route_id.cmp(&b.route_id))
        });
        Router {
            routes,
            not_found: None,
        }
    }

    #[tokio::test]
    async fn test_prefix_match() {
        let router = make_router(vec![("api", "/api", vec![], None)]);
        let mut ctx = test_ctx("GET", "/api/users", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.get_str("matched"), Some("api"));
    }

    #[tokio::test]
    async fn test_longest_literal_match_wins() {
        let router = make_router(vec![
            ("short", "/api", vec![], None),
            ("long", "/api/v1", vec![], None),
        ]);
        let mut ctx = test_ctx("GET", "/api/v1/users", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.get_str("matched"), Some("long"));

        let mut ctx = test_ctx("GET", "/api/other", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.get_str("matched"), Some("short"));
    }

    #[tokio::test]
    async fn test_method_filter() {
        let router = make_router(vec![("api", "/api", vec!["GET", "POST"], None)]);

        let mut ctx = test_ctx("POST", "/api/x", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.get_str("matched"), Some("api"));

        let mut ctx = test_ctx("DELETE", "/api/x", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.get_str("matched"), None);
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_host_filter_exact() {
        let router = make_router(vec![("api", "/", vec![], Some("api.example.com"))]);

        let mut ctx = test_ctx("GET", "/x", Some("api.example.com"));
        router.handle(&mut ctx).await;
        assert_eq!(ctx.get_str("matched"), Some("api"));

        let mut ctx = test_ctx("GET", "/x", Some("other.example.com"));
        router.handle(&mut ctx).await;
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);

        let mut ctx = test_ctx("GET", "/x", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_match_is_404() {
        let router = make_router(vec![("api", "/api", vec![], None)]);
        let mut ctx = test_ctx("GET", "/other", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
        assert!(ctx.is_aborted());
    }

    #[tokio::test]
    async fn test_custom_not_found_handler() {
        struct Teapot;
        #[async_trait]
        impl Handler for Teapot {
            async fn handle(&self, ctx: &mut RequestContext) {
                ctx.respond(StatusCode::IM_A_TEAPOT, "");
                ctx.abort();
            }
        }

        let mut router = make_router(vec![("api", "/api", vec![], None)]);
        router.set_not_found(Arc::new(Teapot));

        let mut ctx = test_ctx("GET", "/other", None);
        router.handle(&mut ctx).await;
        assert_eq!(ctx.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_compiled_from_config() {
        use crate::provider::dns::DnsCache;

        let options = Options::from_yaml(
            r#"
routes:
  all:
    paths: ["/", "/api"]
    service_id: backend
services:
  backend:
    url: "http://127.0.0.1:9"
"#,
        )
        .unwrap();
        let resolver = Arc::new(DnsCache::new());
        let services = crate::service::load_services(&options, &resolver)
            .await
            .unwrap();
        let router = Router::new(&options, &services, &HashMap::new()).unwrap();
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_route_middleware_fails_compile() {
        use crate::provider::dns::DnsCache;

        let options = Options::from_yaml(
            r#"
routes:
  all:
    paths: ["/"]
    middlewares: [ghost]
    service_id: backend
services:
  backend:
    url: "http://127.0.0.1:9"
"#,
        )
        .unwrap();
        let resolver = Arc::new(DnsCache::new());
        let services = crate::service::load_services(&options, &resolver)
            .await
            .unwrap();
        let err = match Router::new(&options, &services, &HashMap::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("ghost"));
    }
}
