//! Prometheus tracer — request counters and a duration histogram
//!
//! Kept dependency-free: atomic counters rendered in the Prometheus text
//! exposition format. Histogram buckets are operator-configurable.

use crate::ctx::RequestContext;
use crate::observability::Tracer;
use crate::vars;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default duration buckets, in seconds
const DEFAULT_BUCKETS: [f64; 10] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Prometheus tracer
pub struct PrometheusTracer {
    total_requests: AtomicU64,
    status_1xx: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    duration_sum_micros: AtomicU64,
    duration_count: AtomicU64,
}

impl PrometheusTracer {
    pub fn new(buckets: &[f64]) -> Self {
        let buckets: Vec<f64> = if buckets.is_empty() {
            DEFAULT_BUCKETS.to_vec()
        } else {
            let mut sorted = buckets.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            sorted
        };
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            total_requests: AtomicU64::new(0),
            status_1xx: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            buckets,
            bucket_counts,
            duration_sum_micros: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    fn observe_duration(&self, seconds: f64) {
        for (i, bound) in self.buckets.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_sum_micros
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP bifrost_requests_total Total number of requests\n");
        out.push_str("# TYPE bifrost_requests_total counter\n");
        out.push_str(&format!(
            "bifrost_requests_total {}\n",
            self.total_requests.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP bifrost_responses_total Total responses by status class\n");
        out.push_str("# TYPE bifrost_responses_total counter\n");
        for (class, counter) in [
            ("1xx", &self.status_1xx),
            ("2xx", &self.status_2xx),
            ("3xx", &self.status_3xx),
            ("4xx", &self.status_4xx),
            ("5xx", &self.status_5xx),
        ] {
            out.push_str(&format!(
                "bifrost_responses_total{{class=\"{}\"}} {}\n",
                class,
                counter.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP bifrost_request_duration_seconds Request duration\n");
        out.push_str("# TYPE bifrost_request_duration_seconds histogram\n");
        for (i, bound) in self.buckets.iter().enumerate() {
            out.push_str(&format!(
                "bifrost_request_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bound,
                self.bucket_counts[i].load(Ordering::Relaxed)
            ));
        }
        let count = self.duration_count.load(Ordering::Relaxed);
        out.push_str(&format!(
            "bifrost_request_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            count
        ));
        out.push_str(&format!(
            "bifrost_request_duration_seconds_sum {}\n",
            self.duration_sum_micros.load(Ordering::Relaxed) as f64 / 1e6
        ));
        out.push_str(&format!("bifrost_request_duration_seconds_count {}\n", count));

        out
    }
}

impl Tracer for PrometheusTracer {
    fn start(&self, _ctx: &mut RequestContext) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, ctx: &RequestContext) {
        match ctx.status().as_u16() / 100 {
            1 => self.status_1xx.fetch_add(1, Ordering::Relaxed),
            2 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            3 => self.status_3xx.fetch_add(1, Ordering::Relaxed),
            4 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            _ => self.status_5xx.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(start) = ctx.get_time(vars::TIME) {
            let micros = (chrono::Utc::now() - start).num_microseconds().unwrap_or(0);
            if micros >= 0 {
                self.observe_duration(micros as f64 / 1e6);
            }
        }
    }
}
