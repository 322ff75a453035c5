//! Access log tracer — template-driven request logging
//!
//! The template is parsed once at load. At request finish the precomputed
//! segment list is expanded and the rendered line queued onto a bounded
//! channel; a writer thread drains into a buffered file writer and flushes
//! every `flush_secs`. Shutdown closes the queue and flushes the rest.

use crate::config::{AccessLogOptions, Escape};
use crate::ctx::{RequestContext, VarValue};
use crate::error::{BifrostError, Result};
use crate::observability::Tracer;
use crate::vars::{self, Segment};
use std::io::Write;
use std::sync::mpsc::{RecvTimeoutError, SyncSender, TrySendError};
use std::sync::RwLock;
use std::time::Duration;

/// Queue capacity; rendered lines beyond this are dropped rather than
/// blocking the request path
const QUEUE_CAPACITY: usize = 65536;

/// Template-driven access log
pub struct AccessLogTracer {
    segments: Vec<Segment>,
    escape: Escape,
    time_format: Option<String>,
    tx: RwLock<Option<SyncSender<String>>>,
}

impl AccessLogTracer {
    pub fn new(opts: &AccessLogOptions) -> Result<Self> {
        // Whitespace runs in the template collapse to single spaces
        let template = opts.template.split_whitespace().collect::<Vec<_>>().join(" ");
        let segments = vars::parse_template(&template);

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&opts.output)
            .map_err(|e| {
                BifrostError::Config(format!(
                    "failed to open access log '{}': {}",
                    opts.output, e
                ))
            })?;

        let buffer_size = if opts.buffer_size > 0 {
            opts.buffer_size
        } else {
            64 * 1024
        };
        let flush = Duration::from_secs(opts.flush_secs.max(1));

        let (tx, rx) = std::sync::mpsc::sync_channel::<String>(QUEUE_CAPACITY);

        std::thread::spawn(move || {
            let mut writer = std::io::BufWriter::with_capacity(buffer_size, file);
            loop {
                match rx.recv_timeout(flush) {
                    Ok(entry) => {
                        let _ = writer.write_all(entry.as_bytes());
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = writer.flush();
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        let _ = writer.flush();
                        return;
                    }
                }
            }
        });

        Ok(Self {
            segments,
            escape: opts.escape,
            time_format: opts.time_format.clone(),
            tx: RwLock::new(Some(tx)),
        })
    }

    /// Render the template for one finished request
    pub fn render(&self, ctx: &RequestContext) -> String {
        let mut line = String::with_capacity(128);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => line.push_str(text),
                Segment::Var(name) => {
                    if name == vars::TIME {
                        if let (Some(format), Some(time)) =
                            (&self.time_format, ctx.get_time(vars::TIME))
                        {
                            line.push_str(&time.format(format).to_string());
                            continue;
                        }
                    }
                    match vars::get(name, ctx) {
                        Some(value) => line.push_str(&self.escape_value(name, &value)),
                        // Recognized but unset renders empty; unknown
                        // tokens render verbatim
                        None => {
                            if !vars::is_directive(name) {
                                line.push_str(name);
                            }
                        }
                    }
                }
            }
        }
        line.push('\n');
        line
    }

    fn escape_value(&self, name: &str, value: &str) -> String {
        let needs_escape = name == vars::REQUEST_BODY
            || name.starts_with("$header_")
            || name.starts_with("$upstream_header_");
        if !needs_escape || value.is_empty() {
            return value.to_string();
        }
        match self.escape {
            Escape::Default => escape_default(value),
            Escape::Json => escape_json(value),
            Escape::None => value.to_string(),
        }
    }

    /// Close the queue and flush whatever is buffered
    pub fn shutdown(&self) {
        self.tx.write().unwrap().take();
    }
}

impl Tracer for AccessLogTracer {
    fn start(&self, ctx: &mut RequestContext) {
        ctx.set(vars::TIME, VarValue::Time(chrono::Utc::now()));
    }

    fn finish(&self, ctx: &RequestContext) {
        let line = self.render(ctx);
        let guard = self.tx.read().unwrap();
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(line) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("access log queue is full, entry dropped");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// `\xH` for quotes, backslashes, control and non-printable bytes
fn escape_default(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b == b'"' || b == b'\\' || b < 32 || b > 126 {
            out.push_str(&format!("\\x{:x}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// JSON string escape, quotes included
fn escape_json(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| s.to_string())
}
