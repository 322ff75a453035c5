//! Reverse proxy — forwards requests to one backend target
//!
//! The forwarder's contract: given a rewritten outbound request and a
//! pooled client, produce a response with hop-by-hop headers stripped in
//! both directions.

pub mod client;
pub mod tls;

use crate::config::Protocol;
use crate::error::Result;
use crate::service::health::PassiveHealth;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;

/// Hop-by-hop headers. Removed when sent to the backend and when relaying
/// the response, per RFC 7230 section 6.1. Proxy-Connection is non-standard
/// but still sent by some clients.
pub const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Options for one forwarder
pub struct ProxyOptions {
    /// Target URL template, e.g. "http://10.0.0.1:8080/base"
    pub target: String,
    /// Protocol spoken to the backend
    pub protocol: Protocol,
    /// Weight for the weighted strategy
    pub weight: u32,
    /// Preserve the Trailer header and Te: trailers
    pub transfer_trailer: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            target: String::new(),
            protocol: Protocol::Http,
            weight: 1,
            transfer_trailer: false,
        }
    }
}

/// Hook run over the backend response before it is returned
pub type ModifyResponseFn = Arc<dyn Fn(&mut ProxyOutcome) -> Result<()> + Send + Sync>;

/// The outbound request handed to a forwarder
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer IP appended to X-Forwarded-For
    pub peer_ip: String,
    /// Upgrade handle from the HTTP layer, for transparent tunneling
    pub on_upgrade: Option<hyper::upgrade::OnUpgrade>,
    /// Response headers set before the proxy ran; re-applied after the
    /// backend answers so middleware-populated headers survive the call
    pub saved_resp_headers: HeaderMap,
}

/// What the forwarder produced
pub struct ProxyOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The client error was a timeout; the service translates this to 504
    pub target_timeout: bool,
    /// host[:port] of the selected target
    pub upstream_addr: String,
    /// X-Forwarded-For chain as sent upstream
    pub forwarded_for: Option<String>,
}

/// The forwarder for a single target URL
pub struct Proxy {
    target: String,
    target_host: String,
    protocol: Protocol,
    weight: u32,
    transfer_trailer: bool,
    client: reqwest::Client,
    health: PassiveHealth,
    modify_response: Option<ModifyResponseFn>,
}

impl Proxy {
    /// Build a forwarder for a target URL with a pooled client
    pub fn new(opts: ProxyOptions, client: reqwest::Client) -> Self {
        let target_host = host_of(&opts.target);
        Self {
            target: opts.target,
            target_host,
            protocol: opts.protocol,
            weight: opts.weight,
            transfer_trailer: opts.transfer_trailer,
            client,
            health: PassiveHealth::new(),
            modify_response: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Install the response hook
    pub fn set_modify_response(&mut self, hook: ModifyResponseFn) {
        self.modify_response = Some(hook);
    }

    /// Passive health feedback: returns true when the target just got
    /// sidelined.
    pub fn add_failed_count(&self, count: u32) -> bool {
        self.health.add_failed(count)
    }

    /// Whether this target may receive traffic
    pub fn is_available(&self) -> bool {
        self.health.is_available()
    }

    /// Forward one request. Errors never escape: they become a 502 outcome
    /// (the default error handler), with `target_timeout` set for timeouts.
    pub async fn forward(&self, mut req: ProxyRequest) -> ProxyOutcome {
        // The upgrade intent is read before stripping removes the header
        let upgrade_type = match req.headers.get(header::UPGRADE) {
            None => None,
            Some(value) => match value.to_str() {
                Ok(s) if !s.is_empty() && is_ascii_printable(s) => Some(s.to_string()),
                Ok(s) if s.is_empty() => None,
                _ => {
                    tracing::error!(
                        upstream = %self.target,
                        "client tried to switch to an invalid protocol"
                    );
                    return self.error_outcome(false, None);
                }
            },
        };

        let has_te_trailer = self.transfer_trailer
            && req
                .headers
                .get_all(header::TE)
                .iter()
                .any(|v| v.to_str().map(|s| s.contains("trailers")).unwrap_or(false));

        remove_connection_named_headers(&mut req.headers);
        self.strip_hop_headers(&mut req.headers);
        if has_te_trailer {
            req.headers.insert(header::TE, HeaderValue::from_static("trailers"));
        }

        let forwarded_for = append_forwarded_for(&mut req.headers, &req.peer_ip);

        // HTTP/2 carries the authority in the request target
        if self.protocol == Protocol::Http2 {
            req.headers.remove(header::HOST);
        }

        let uri = join_url_path(&self.target, &req.path, req.query.as_deref());

        if let Some(up_type) = upgrade_type {
            return self.forward_upgrade(req, uri, up_type, forwarded_for).await;
        }

        let result = self
            .client
            .request(req.method.clone(), &uri)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    upstream = format!("{} {}", req.method, uri),
                    "sent upstream error"
                );
                return self.error_outcome(e.is_timeout(), forwarded_for);
            }
        };

        let status = resp.status();
        let mut headers = resp.headers().clone();
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    upstream = format!("{} {}", req.method, uri),
                    "read upstream body error"
                );
                return self.error_outcome(e.is_timeout(), forwarded_for);
            }
        };

        for (key, value) in req.saved_resp_headers.iter() {
            headers.append(key, value.clone());
        }

        remove_connection_named_headers(&mut headers);
        self.strip_hop_headers(&mut headers);

        let mut outcome = ProxyOutcome {
            status,
            headers,
            body,
            target_timeout: false,
            upstream_addr: self.target_host.clone(),
            forwarded_for,
        };

        if let Some(hook) = &self.modify_response {
            if let Err(e) = hook(&mut outcome) {
                tracing::error!(error = %e, upstream = %self.target, "modify response failed");
                return self.error_outcome(false, outcome.forwarded_for);
            }
        }

        outcome
    }

    /// Forward a protocol upgrade. A 101 from the backend starts a
    /// transparent tunnel between the two upgraded streams; anything else
    /// is relayed as a normal response.
    async fn forward_upgrade(
        &self,
        req: ProxyRequest,
        uri: String,
        up_type: String,
        forwarded_for: Option<String>,
    ) -> ProxyOutcome {
        let mut headers = req.headers;
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        match HeaderValue::from_str(&up_type) {
            Ok(value) => {
                headers.insert(header::UPGRADE, value);
            }
            Err(_) => return self.error_outcome(false, forwarded_for),
        }

        let result = self
            .client
            .request(req.method.clone(), &uri)
            .headers(headers)
            .body(req.body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    upstream = format!("{} {}", req.method, uri),
                    "sent upstream error"
                );
                return self.error_outcome(e.is_timeout(), forwarded_for);
            }
        };

        let status = resp.status();
        let resp_headers = resp.headers().clone();

        if status == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(on_upgrade) = req.on_upgrade {
                tokio::spawn(async move {
                    let backend = match resp.upgrade().await {
                        Ok(io) => io,
                        Err(e) => {
                            tracing::error!(error = %e, "backend upgrade failed");
                            return;
                        }
                    };
                    let client_side = match on_upgrade.await {
                        Ok(io) => io,
                        Err(e) => {
                            tracing::error!(error = %e, "client upgrade failed");
                            return;
                        }
                    };
                    let mut client_io = TokioIo::new(client_side);
                    let mut backend_io = backend;
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await
                    {
                        tracing::debug!(error = %e, "upgrade tunnel closed");
                    }
                });
            }

            // 101 keeps its Connection/Upgrade headers; the handshake needs them
            return ProxyOutcome {
                status,
                headers: resp_headers,
                body: Bytes::new(),
                target_timeout: false,
                upstream_addr: self.target_host.clone(),
                forwarded_for,
            };
        }

        // Backend declined the upgrade: relay as a plain response
        let mut headers = resp_headers;
        let body = resp.bytes().await.unwrap_or_default();
        remove_connection_named_headers(&mut headers);
        self.strip_hop_headers(&mut headers);

        ProxyOutcome {
            status,
            headers,
            body,
            target_timeout: false,
            upstream_addr: self.target_host.clone(),
            forwarded_for,
        }
    }

    fn strip_hop_headers(&self, headers: &mut HeaderMap) {
        for name in HOP_HEADERS {
            if self.transfer_trailer && name == "trailer" {
                continue;
            }
            headers.remove(name);
        }
    }

    fn error_outcome(&self, timeout: bool, forwarded_for: Option<String>) -> ProxyOutcome {
        ProxyOutcome {
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            target_timeout: timeout,
            upstream_addr: self.target_host.clone(),
            forwarded_for,
        }
    }
}

/// Join the target template with the inbound path and query.
///
/// Slash semantics: when both sides contribute a slash one is collapsed,
/// when neither does one is inserted. The target-side query comes first
/// with `?`, the client query follows with `&`.
pub fn join_url_path(target: &str, req_path: &str, req_query: Option<&str>) -> String {
    let (target_base, target_query) = match target.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (target, None),
    };

    let aslash = req_path.starts_with('/');
    let bslash = target_base.ends_with('/');

    let mut out = String::with_capacity(target.len() + req_path.len() + 8);
    out.push_str(target_base);
    match (aslash, bslash) {
        (true, true) => out.push_str(&req_path[1..]),
        (false, false) => {
            out.push('/');
            out.push_str(req_path);
        }
        _ => out.push_str(req_path),
    }

    if let Some(query) = target_query {
        out.push('?');
        out.push_str(query);
    }
    if let Some(query) = req_query {
        if !query.is_empty() {
            out.push(if target_query.is_some() { '&' } else { '?' });
            out.push_str(query);
        }
    }
    out
}

/// Remove headers named in Connection tokens, per RFC 7230 section 6.1
fn remove_connection_named_headers(headers: &mut HeaderMap) {
    let mut named = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    named.push(token.to_string());
                }
            }
        }
    }
    for name in named {
        headers.remove(name.as_str());
    }
}

/// Append the peer IP to X-Forwarded-For. An existing empty value is
/// dropped rather than forwarded. Returns the chain as sent upstream.
fn append_forwarded_for(headers: &mut HeaderMap, peer_ip: &str) -> Option<String> {
    match headers.get("x-forwarded-for") {
        None => {
            if let Ok(value) = HeaderValue::from_str(peer_ip) {
                headers.insert("x-forwarded-for", value);
            }
            Some(peer_ip.to_string())
        }
        Some(existing) => {
            let existing = existing.to_str().unwrap_or("").to_string();
            if existing.is_empty() {
                headers.remove("x-forwarded-for");
                return None;
            }
            let chain = format!("{}, {}", existing, peer_ip);
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert("x-forwarded-for", value);
            }
            Some(chain)
        }
    }
}

fn is_ascii_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

fn host_of(target: &str) -> String {
    let rest = match target.split_once("://") {
        Some((_, rest)) => rest,
        None => target,
    };
    rest.split('/').next().unwrap_or("").to_string()
}
