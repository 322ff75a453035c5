//! Observability — tracers consuming per-request observation events
//!
//! A tracer observes the start and finish of every request on a server.
//! The access log and the Prometheus exporter are tracers; servers hold a
//! list and invoke them around the engine run.

pub mod access_log;
pub mod metrics;

pub use access_log::AccessLogTracer;
pub use metrics::PrometheusTracer;

use crate::ctx::RequestContext;

/// Per-request observation hooks
pub trait Tracer: Send + Sync {
    /// Called before the engine runs
    fn start(&self, ctx: &mut RequestContext);

    /// Called after the response is complete
    fn finish(&self, ctx: &RequestContext);
}
