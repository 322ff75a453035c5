//! Per-request context — variable bag, chain cursor, carrier cancellation
//!
//! A `RequestContext` lives for exactly one request. It carries the inbound
//! request, the response under construction, the request-scoped variables
//! threaded through middlewares and the access-log template, and the cursor
//! over the handler chain currently executing.

use crate::engine::{Handler, HandlersChain};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A request-scoped variable value
#[derive(Debug, Clone)]
pub enum VarValue {
    Str(String),
    Bool(bool),
    Time(DateTime<Utc>),
}

/// Client IP resolver; injected so trust-proxy policies can be plugged in
pub type ClientIpFn = dyn Fn(&RequestContext) -> String + Send + Sync;

/// Per-request context
pub struct RequestContext {
    /// Inbound request head; middlewares mutate the URI and headers in place
    pub head: http::request::Parts,
    /// Buffered request body
    pub body: Bytes,
    /// Peer address of the client connection
    pub remote_addr: SocketAddr,

    /// Response head under construction
    pub resp: http::response::Parts,
    /// Response body
    pub resp_body: Bytes,

    /// Pending protocol upgrade handle from the HTTP layer
    pub on_upgrade: Option<hyper::upgrade::OnUpgrade>,

    /// Carrier cancellation: fires when the HTTP layer abandons the request
    pub cancel: CancellationToken,

    vars: HashMap<String, VarValue>,
    client_ip_fn: Option<Arc<ClientIpFn>>,

    handlers: Arc<HandlersChain>,
    index: isize,
    aborted: bool,
}

impl RequestContext {
    /// Build a context for one inbound request
    pub fn new(
        head: http::request::Parts,
        body: Bytes,
        remote_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        let (resp, _) = http::Response::builder()
            .status(StatusCode::OK)
            .body(())
            .expect("static response builder")
            .into_parts();

        Self {
            head,
            body,
            remote_addr,
            resp,
            resp_body: Bytes::new(),
            on_upgrade: None,
            cancel,
            vars: HashMap::new(),
            client_ip_fn: None,
            handlers: Arc::new(Vec::new()),
            index: -1,
            aborted: false,
        }
    }

    // --- variable bag ---

    /// Store a variable
    pub fn set(&mut self, name: impl Into<String>, value: VarValue) {
        self.vars.insert(name.into(), value);
    }

    /// Store a string variable
    pub fn set_str(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), VarValue::Str(value.into()));
    }

    /// Read a variable
    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.vars.get(name)
    }

    /// Read a string variable
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.vars.get(name) {
            Some(VarValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Read a boolean variable; unset reads as false
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.vars.get(name), Some(VarValue::Bool(true)))
    }

    /// Read a timestamp variable
    pub fn get_time(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.vars.get(name) {
            Some(VarValue::Time(t)) => Some(*t),
            _ => None,
        }
    }

    // --- client identity ---

    /// Install the client IP resolver
    pub fn set_client_ip_fn(&mut self, f: Arc<ClientIpFn>) {
        self.client_ip_fn = Some(f);
    }

    /// Resolve the client IP; falls back to the peer address
    pub fn client_ip(&self) -> String {
        match &self.client_ip_fn {
            Some(f) => f(self),
            None => self.remote_addr.ip().to_string(),
        }
    }

    // --- request accessors ---

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.head.uri.query()
    }

    /// Host header value, if present and valid UTF-8
    pub fn host(&self) -> Option<&str> {
        self.head
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
    }

    /// Protocol string of the inbound request, e.g. "HTTP/1.1"
    pub fn protocol(&self) -> &'static str {
        match self.head.version {
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2",
            _ => "HTTP/1.1",
        }
    }

    /// "METHOD path?query" for log lines
    pub fn full_uri(&self) -> String {
        match self.query() {
            Some(q) => format!("{} {}?{}", self.head.method, self.path(), q),
            None => format!("{} {}", self.head.method, self.path()),
        }
    }

    /// Replace the request path, preserving the query string
    pub fn set_path(&mut self, new_path: &str) {
        let pq = match self.query() {
            Some(q) => format!("{}?{}", new_path, q),
            None => new_path.to_string(),
        };
        let mut builder = Uri::builder();
        if let Some(scheme) = self.head.uri.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.head.uri.authority() {
            builder = builder.authority(authority.clone());
        }
        if let Ok(uri) = builder.path_and_query(pq).build() {
            self.head.uri = uri;
        }
    }

    // --- response helpers ---

    pub fn set_status(&mut self, status: StatusCode) {
        self.resp.status = status;
    }

    pub fn status(&self) -> StatusCode {
        self.resp.status
    }

    pub fn resp_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.resp.headers
    }

    /// Set the response body and status together
    pub fn respond(&mut self, status: StatusCode, body: impl Into<Bytes>) {
        self.resp.status = status;
        self.resp_body = body.into();
    }

    // --- chain cursor ---

    /// Install the handler chain and rewind the cursor
    pub fn set_handlers(&mut self, handlers: Arc<HandlersChain>) {
        self.handlers = handlers;
        self.index = -1;
    }

    /// Abort the chain: no later handler observes this request
    pub fn abort(&mut self) {
        self.aborted = true;
        self.index = self.handlers.len() as isize;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Advance through the remaining handlers in order.
    ///
    /// A handler may itself call `next()` to run the rest of the chain
    /// within its own frame; the outer loop then finds the cursor past the
    /// end and returns.
    pub async fn next(&mut self) {
        self.index += 1;
        while !self.aborted && (self.index as usize) < self.handlers.len() {
            let handler: Arc<dyn Handler> = self.handlers[self.index as usize].clone();
            handler.handle(self).await;
            self.index += 1;
        }
    }

    /// Run a nested chain (the router installs the matched route's tail
    /// chain this way), restoring the outer cursor afterwards.
    pub async fn run_chain(&mut self, chain: Arc<HandlersChain>) {
        let saved_handlers = std::mem::replace(&mut self.handlers, chain);
        let saved_index = std::mem::replace(&mut self.index, -1);
        self.next().await;
        self.handlers = saved_handlers;
        self.index = saved_index;
    }
}
