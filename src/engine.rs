//! Engine — the ordered handler chain executed per request
//!
//! An engine is immutable after construction. Hot reload builds a fresh
//! engine and publishes it through the server's atomic switcher; requests
//! already in flight keep the engine they captured at entry.

use crate::ctx::RequestContext;
use async_trait::async_trait;
use std::sync::Arc;

/// A handler in the chain.
///
/// Handlers run in installation order. A handler may mutate the context,
/// call `ctx.next()` to run the remainder of the chain inside its own
/// frame, or `ctx.abort()` so that no later handler observes the request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext);
}

/// Ordered handler chain
pub type HandlersChain = Vec<Arc<dyn Handler>>;

/// The engine: the full handler chain for one server
pub struct Engine {
    handlers: HandlersChain,
    not_found: Option<Arc<dyn Handler>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            not_found: None,
        }
    }

    /// Append a handler to the chain
    pub fn use_handler(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Install the not-found handler, appended after the chain
    pub fn set_not_found(&mut self, handler: Arc<dyn Handler>) {
        self.not_found = Some(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Execute the chain for one request
    pub async fn serve(&self, ctx: &mut RequestContext) {
        let mut chain = self.handlers.clone();
        if let Some(nf) = &self.not_found {
            chain.push(nf.clone());
        }
        ctx.set_handlers(Arc::new(chain));
        ctx.next().await;
        ctx.abort();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> RequestContext {
        let (head, _) = http::Request::builder()
            .uri("/t")
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

    struct Recorder {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        name: &'static str,
        abort: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, ctx: &mut RequestContext) {
            self.order.lock().unwrap().push(self.name);
            if self.abort {
                ctx.abort();
            }
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_declared_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        for name in ["a", "b", "c"] {
            engine.use_handler(Arc::new(Recorder {
                order: order.clone(),
                name,
                abort: false,
            }));
        }

        let mut ctx = test_ctx();
        engine.serve(&mut ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_abort_stops_the_chain() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine.use_handler(Arc::new(Recorder {
            order: order.clone(),
            name: "a",
            abort: false,
        }));
        engine.use_handler(Arc::new(Recorder {
            order: order.clone(),
            name: "b",
            abort: true,
        }));
        engine.use_handler(Arc::new(Recorder {
            order: order.clone(),
            name: "c",
            abort: false,
        }));

        let mut ctx = test_ctx();
        engine.serve(&mut ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert!(ctx.is_aborted());
    }

    struct WrapAround {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for WrapAround {
        async fn handle(&self, ctx: &mut RequestContext) {
            self.order.lock().unwrap().push("before");
            ctx.next().await;
            self.order.lock().unwrap().push("after");
        }
    }

    #[tokio::test]
    async fn test_handler_may_run_remainder_in_its_frame() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine.use_handler(Arc::new(WrapAround {
            order: order.clone(),
        }));
        engine.use_handler(Arc::new(Recorder {
            order: order.clone(),
            name: "tail",
            abort: false,
        }));

        let mut ctx = test_ctx();
        engine.serve(&mut ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["before", "tail", "after"]);
    }

    struct SetStatus(StatusCode);

    #[async_trait]
    impl Handler for SetStatus {
        async fn handle(&self, ctx: &mut RequestContext) {
            ctx.set_status(self.0);
        }
    }

    #[tokio::test]
    async fn test_not_found_runs_after_chain() {
        let mut engine = Engine::new();
        engine.set_not_found(Arc::new(SetStatus(StatusCode::NOT_FOUND)));

        let mut ctx = test_ctx();
        engine.serve(&mut ctx).await;
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_nested_chain_restores_cursor() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Nester {
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
            inner: Arc<HandlersChain>,
        }

        #[async_trait]
        impl Handler for Nester {
            async fn handle(&self, ctx: &mut RequestContext) {
                self.order.lock().unwrap().push("outer");
                ctx.run_chain(self.inner.clone()).await;
            }
        }

        let inner: Arc<HandlersChain> = Arc::new(vec![Arc::new(Recorder {
            order: order.clone(),
            name: "inner",
            abort: false,
        }) as Arc<dyn Handler>]);

        let mut engine = Engine::new();
        engine.use_handler(Arc::new(Nester {
            order: order.clone(),
            inner,
        }));
        engine.use_handler(Arc::new(Recorder {
            order: order.clone(),
            name: "tail",
            abort: false,
        }));

        let mut ctx = test_ctx();
        engine.serve(&mut ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "tail"]);
    }

    #[tokio::test]
    async fn test_abort_in_nested_chain_aborts_outer() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Nester {
            inner: Arc<HandlersChain>,
        }

        #[async_trait]
        impl Handler for Nester {
            async fn handle(&self, ctx: &mut RequestContext) {
                ctx.run_chain(self.inner.clone()).await;
            }
        }

        let inner: Arc<HandlersChain> = Arc::new(vec![Arc::new(Recorder {
            order: order.clone(),
            name: "inner",
            abort: true,
        }) as Arc<dyn Handler>]);

        let mut engine = Engine::new();
        engine.use_handler(Arc::new(Nester { inner }));
        engine.use_handler(Arc::new(Recorder {
            order: order.clone(),
            name: "tail",
            abort: false,
        }));

        let mut ctx = test_ctx();
        engine.serve(&mut ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["inner"]);
    }
}
