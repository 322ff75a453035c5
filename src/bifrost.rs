//! Bifrost orchestrator — load, run, reload, shutdown
//!
//! Ties configuration, the DNS cache, tracers, servers and the
//! zero-downtime coordinator into one unit. In-process hot reload builds a
//! fresh engine per unchanged server bind and publishes it through the
//! server's switcher; listeners are never rebound during reload.

use crate::config::{Options, ServerOptions};
use crate::engine::Engine;
use crate::error::{BifrostError, Result};
use crate::middleware::{self, InitMiddleware};
use crate::observability::{AccessLogTracer, PrometheusTracer, Tracer};
use crate::provider::{DnsCache, FileProvider};
use crate::router::Router;
use crate::server::HttpServer;
use crate::service;
use crate::zero::{ZeroDownTime, ZeroOptions};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// The gateway instance
pub struct Bifrost {
    options: RwLock<Options>,
    servers: HashMap<String, Arc<HttpServer>>,
    resolver: Arc<DnsCache>,
    zero: Arc<ZeroDownTime>,
    access_logs: Vec<Arc<AccessLogTracer>>,
    prometheus: Option<Arc<PrometheusTracer>>,
    stop: CancellationToken,
}

impl Bifrost {
    /// Load from a config file, merging provider paths
    pub async fn load_from_config(path: &str) -> Result<Self> {
        let provider = FileProvider::new(path);
        let options = provider.load()?;
        Self::load(options).await
    }

    /// Load from an in-memory configuration document
    pub async fn load(options: Options) -> Result<Self> {
        options.validate()?;

        let stop = CancellationToken::new();
        let resolver = Arc::new(DnsCache::new());
        resolver.spawn_refresh(stop.clone());

        let zero = Arc::new(ZeroDownTime::new(ZeroOptions::default()));

        let prometheus = if options.metrics.prometheus.enabled {
            Some(Arc::new(PrometheusTracer::new(
                &options.metrics.prometheus.buckets,
            )))
        } else {
            None
        };

        let mut access_log_tracers: HashMap<String, Arc<AccessLogTracer>> = HashMap::new();
        for (id, log_opts) in &options.access_logs {
            if !log_opts.enabled {
                continue;
            }
            let tracer = AccessLogTracer::new(log_opts)?;
            access_log_tracers.insert(id.clone(), Arc::new(tracer));
        }

        let mut servers = HashMap::new();
        for (id, server_opts) in &options.servers {
            if id.is_empty() {
                return Err(BifrostError::Config("http server id can't be empty".into()));
            }

            let mut tracers: Vec<Arc<dyn Tracer>> = Vec::new();
            if let Some(prom) = &prometheus {
                tracers.push(prom.clone() as Arc<dyn Tracer>);
            }
            if let Some(log_id) = &server_opts.access_log_id {
                let tracer = access_log_tracers.get(log_id).ok_or_else(|| {
                    BifrostError::Config(format!(
                        "access log '{}' was not found in server '{}'",
                        log_id, id
                    ))
                })?;
                tracers.push(tracer.clone() as Arc<dyn Tracer>);
            }

            let engine = build_engine(&options, id, server_opts, &resolver).await?;
            let server = HttpServer::new(id, server_opts, engine, tracers, &zero)?;
            servers.insert(id.clone(), Arc::new(server));
        }

        Ok(Self {
            options: RwLock::new(options),
            servers,
            resolver,
            zero,
            access_logs: access_log_tracers.into_values().collect(),
            prometheus,
            stop,
        })
    }

    /// Spawn every server's accept loop
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<Result<()>>> {
        let mut handles = Vec::with_capacity(self.servers.len());
        for server in self.servers.values() {
            let server = server.clone();
            let stop = self.stop.clone();
            handles.push(tokio::spawn(async move { server.run(stop).await }));
        }
        handles
    }

    /// Rebuild engines from a new configuration and publish them.
    ///
    /// Only servers whose id and bind are unchanged are swapped; requests
    /// already in flight finish on the engine they captured.
    pub async fn reload(&self, new_options: Options) -> Result<()> {
        new_options.validate()?;
        tracing::info!("bifrost: reloading...");

        let mut is_reloaded = false;
        for (id, server) in &self.servers {
            let Some(server_opts) = new_options.servers.get(id) else {
                continue;
            };
            if server_opts.bind != server.bind() {
                continue;
            }
            let engine = build_engine(&new_options, id, server_opts, &self.resolver).await?;
            server.switcher().store(Arc::new(engine));
            is_reloaded = true;
        }

        *self.options.write().unwrap() = new_options;
        tracing::info!(is_reloaded = is_reloaded, "bifrost is reloaded successfully");
        Ok(())
    }

    /// Watch the config file and reload on changes. The watcher thread
    /// lives until shutdown.
    pub fn watch(self: &Arc<Self>, path: &str) -> Result<()> {
        let provider = FileProvider::new(path);
        let rx = provider.watch()?;
        let (tx, mut reload_rx) = tokio::sync::mpsc::channel::<()>(1);

        std::thread::spawn(move || {
            while rx.recv().is_ok() {
                // Coalesce; a pending notification is enough
                let _ = tx.try_send(());
            }
        });

        let bifrost = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = bifrost.stop.cancelled() => return,
                    received = reload_rx.recv() => {
                        if received.is_none() {
                            return;
                        }
                        let provider = FileProvider::new(&path);
                        match provider.load() {
                            Ok(new_options) => {
                                if let Err(e) = bifrost.reload(new_options).await {
                                    tracing::error!(error = %e, "bifrost: fail to reload config");
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "config reload failed, keeping current config");
                            }
                        }
                    }
                }
            }
        });

        tracing::info!("hot reload enabled");
        Ok(())
    }

    /// The zero-downtime coordinator
    pub fn zero(&self) -> &Arc<ZeroDownTime> {
        &self.zero
    }

    /// Cancellation root shared by all background tasks
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Current configuration snapshot
    pub fn options(&self) -> Options {
        self.options.read().unwrap().clone()
    }

    pub fn server(&self, id: &str) -> Option<&Arc<HttpServer>> {
        self.servers.get(id)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// The Prometheus tracer, when metrics are enabled
    pub fn prometheus(&self) -> Option<&Arc<PrometheusTracer>> {
        self.prometheus.as_ref()
    }

    /// Stop accepting, drain, flush logs, drop the PID file
    pub async fn shutdown(&self) {
        tracing::info!("bifrost shutting down");
        self.stop.cancel();
        for log in &self.access_logs {
            log.shutdown();
        }
        self.remove_own_pid();
        tracing::info!("bifrost stopped");
    }

    /// Remove the PID file only when it still records this process; the
    /// upgrade child rewrites it with its own PID.
    fn remove_own_pid(&self) {
        self.zero.remove_pid();
    }
}

/// Build the handler chain for one server: init middleware, server-level
/// middlewares, then the router.
pub(crate) async fn build_engine(
    options: &Options,
    server_id: &str,
    server_opts: &ServerOptions,
    resolver: &Arc<DnsCache>,
) -> Result<Engine> {
    let middlewares = middleware::load_middlewares(&options.middlewares)?;
    let services = service::load_services(options, resolver).await?;
    let router = Router::new(options, &services, &middlewares)?;

    let mut engine = Engine::new();
    engine.use_handler(Arc::new(InitMiddleware::new(server_id)));

    for mw_id in &server_opts.middlewares {
        let handler = middlewares.get(mw_id).ok_or_else(|| {
            BifrostError::Config(format!(
                "middleware '{}' was not found in server '{}'",
                mw_id, server_id
            ))
        })?;
        engine.use_handler(handler.clone());
    }

    engine.use_handler(Arc::new(router));
    Ok(engine)
}

/// Block until SIGTERM or Ctrl+C
pub async fn wait_for_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = term.recv() => {
            tracing::info!("SIGTERM received");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
    }
}
