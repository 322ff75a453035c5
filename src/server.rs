//! HTTP server — one listener, one atomically swappable engine
//!
//! The engine pointer is the only shared mutable state: requests load it
//! once at entry, hot reload publishes a fresh engine with an atomic
//! store. Requests in flight finish on the engine they captured.

use crate::config::ServerOptions;
use crate::ctx::RequestContext;
use crate::engine::Engine;
use crate::error::{BifrostError, Result};
use crate::observability::Tracer;
use crate::proxy::tls::build_tls_acceptor;
use crate::zero::ZeroDownTime;
use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// One configured server: listener, TLS, engine switcher, tracers
pub struct HttpServer {
    id: String,
    opts: ServerOptions,
    listener: Mutex<Option<std::net::TcpListener>>,
    switcher: Arc<ArcSwap<Engine>>,
    tracers: Arc<Vec<Arc<dyn Tracer>>>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl HttpServer {
    /// Bind the listener (or inherit it across an upgrade) and prepare the
    /// server. Accepting starts with [`run`].
    pub fn new(
        id: &str,
        opts: &ServerOptions,
        engine: Engine,
        tracers: Vec<Arc<dyn Tracer>>,
        zero: &ZeroDownTime,
    ) -> Result<Self> {
        if opts.bind.is_empty() {
            return Err(BifrostError::Config(format!(
                "http server bind can't be empty, server id: {}",
                id
            )));
        }

        let listener = zero.listen(&opts.bind, opts.reuse_port)?;
        listener.set_nonblocking(true)?;

        let tls_acceptor = match &opts.tls {
            Some(tls_opts) => Some(build_tls_acceptor(tls_opts, opts.http2)?),
            None => None,
        };

        Ok(Self {
            id: id.to_string(),
            opts: opts.clone(),
            listener: Mutex::new(Some(listener)),
            switcher: Arc::new(ArcSwap::from_pointee(engine)),
            tracers: Arc::new(tracers),
            tls_acceptor,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bind(&self) -> &str {
        &self.opts.bind
    }

    /// The engine switcher; reload publishes a new engine through it
    pub fn switcher(&self) -> &Arc<ArcSwap<Engine>> {
        &self.switcher
    }

    /// Accept connections until `stop` fires, then drain within the
    /// graceful window.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        let std_listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BifrostError::Other(format!("server '{}' already running", self.id)))?;
        let listener = tokio::net::TcpListener::from_std(std_listener)?;

        tracing::info!(id = %self.id, bind = %self.opts.bind, http2 = self.opts.http2, tls = self.tls_acceptor.is_some(), "starting server");

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    let switcher = self.switcher.clone();
                    let tracers = self.tracers.clone();
                    let tls_acceptor = self.tls_acceptor.clone();
                    let http2 = self.opts.http2;
                    let read_timeout = self.opts.timeout.read_secs;

                    tracker.spawn(async move {
                        match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    serve_connection(
                                        TokioIo::new(tls_stream),
                                        remote_addr,
                                        switcher,
                                        tracers,
                                        http2,
                                        read_timeout,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "TLS handshake failed");
                                }
                            },
                            None => {
                                serve_connection(
                                    TokioIo::new(stream),
                                    remote_addr,
                                    switcher,
                                    tracers,
                                    http2,
                                    read_timeout,
                                )
                                .await;
                            }
                        }
                    });
                }
            }
        }

        // Drain in-flight connections within the graceful window
        tracker.close();
        let graceful = Duration::from_secs(self.opts.timeout.graceful_secs.unwrap_or(10));
        if tokio::time::timeout(graceful, tracker.wait()).await.is_err() {
            tracing::warn!(id = %self.id, "graceful window elapsed, closing remaining connections");
        }
        tracing::info!(id = %self.id, "server stopped");
        Ok(())
    }
}

async fn serve_connection<I>(
    io: I,
    remote_addr: SocketAddr,
    switcher: Arc<ArcSwap<Engine>>,
    tracers: Arc<Vec<Arc<dyn Tracer>>>,
    http2: bool,
    read_timeout_secs: Option<u64>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let switcher = switcher.clone();
        let tracers = tracers.clone();
        async move {
            // Captured once; a reload mid-request does not affect us
            let engine = switcher.load_full();
            Ok::<_, std::convert::Infallible>(
                dispatch_request(req, remote_addr, engine, tracers).await,
            )
        }
    });

    if http2 {
        // Serves HTTP/1.1 and H2/H2C alike
        let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
        builder.http1().timer(TokioTimer::new());
        builder.http2().timer(TokioTimer::new());
        if let Err(e) = builder
            .serve_connection_with_upgrades(io, service)
            .await
        {
            tracing::debug!(error = %e, "connection ended");
        }
    } else {
        let mut builder = hyper::server::conn::http1::Builder::new();
        builder.keep_alive(true).timer(TokioTimer::new());
        if let Some(secs) = read_timeout_secs {
            builder.header_read_timeout(Duration::from_secs(secs));
        }
        if let Err(e) = builder
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!(error = %e, "connection ended");
        }
    }
}

/// Run one request through the engine in its own task.
///
/// The HTTP layer drops this future when the client goes away; the drop
/// guard then cancels the carrier token, and the spawned engine task still
/// finishes its bookkeeping (499 status, access-log entry).
async fn dispatch_request(
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
    engine: Arc<Engine>,
    tracers: Arc<Vec<Arc<dyn Tracer>>>,
) -> hyper::Response<Full<Bytes>> {
    let (head, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request body");
            return simple_response(http::StatusCode::BAD_REQUEST);
        }
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let task = tokio::spawn(async move {
        let mut ctx = RequestContext::new(head, body_bytes, remote_addr, cancel);
        ctx.on_upgrade = ctx.head.extensions.remove::<hyper::upgrade::OnUpgrade>();

        for tracer in tracers.iter() {
            tracer.start(&mut ctx);
        }
        engine.serve(&mut ctx).await;
        for tracer in tracers.iter() {
            tracer.finish(&ctx);
        }

        let mut builder = hyper::Response::builder().status(ctx.status());
        for (key, value) in ctx.resp.headers.iter() {
            builder = builder.header(key, value);
        }
        builder
            .body(Full::new(ctx.resp_body))
            .unwrap_or_else(|_| simple_response(http::StatusCode::INTERNAL_SERVER_ERROR))
    });

    match task.await {
        Ok(response) => {
            guard.disarm();
            response
        }
        Err(e) => {
            guard.disarm();
            tracing::error!(panic = %e, "request handler panicked");
            simple_response(http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn simple_response(status: http::StatusCode) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}
