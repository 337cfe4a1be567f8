//! Prometheus metrics for Courier buses.
//!
//! All metrics follow the naming convention: `courier_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: messages sent and received per pattern, RPC calls per outcome
//! - **Gauge**: reply multiplexer counters, copied from the bus on demand
//! - **Histogram**: RPC call latency

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Instant;

use crate::TelemetryError;

/// Snapshot of the reply multiplexer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyCounts {
    pub registered: u64,
    pub dispatched: u64,
    pub orphaned: u64,
    pub cancelled: u64,
}

/// Metrics registry for one process.
#[derive(Clone)]
pub struct BusMetrics {
    registry: Registry,

    /// Messages handed to the broker, by pattern (direct, task, event, rpc)
    pub messages_sent: IntCounterVec,

    /// Messages delivered to handlers, by pattern
    pub messages_received: IntCounterVec,

    /// RPC calls by outcome (ok, remote_error, timeout, error)
    pub rpc_calls: IntCounterVec,

    /// RPC round-trip latency
    pub rpc_duration: Histogram,

    /// Reply multiplexer counters, by kind
    pub replies: IntGaugeVec,
}

fn init_err(e: prometheus::Error) -> TelemetryError {
    TelemetryError::MetricsInit(e.to_string())
}

impl BusMetrics {
    /// Create and register every metric in a fresh registry.
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new("courier_messages_sent_total", "Messages handed to the broker"),
            &["pattern"],
        )
        .map_err(init_err)?;

        let messages_received = IntCounterVec::new(
            Opts::new(
                "courier_messages_received_total",
                "Messages delivered to handlers",
            ),
            &["pattern"],
        )
        .map_err(init_err)?;

        let rpc_calls = IntCounterVec::new(
            Opts::new("courier_rpc_calls_total", "RPC calls by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?;

        let buckets = exponential_buckets(0.0005, 2.0, 16).map_err(init_err)?;
        let rpc_duration = Histogram::with_opts(
            HistogramOpts::new(
                "courier_rpc_call_duration_seconds",
                "Time from publishing a call to its resolution",
            )
            .buckets(buckets),
        )
        .map_err(init_err)?;

        let replies = IntGaugeVec::new(
            Opts::new("courier_rpc_replies", "Reply multiplexer counters"),
            &["kind"],
        )
        .map_err(init_err)?;

        registry
            .register(Box::new(messages_sent.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(messages_received.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rpc_calls.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(rpc_duration.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(replies.clone()))
            .map_err(init_err)?;

        Ok(Self {
            registry,
            messages_sent,
            messages_received,
            rpc_calls,
            rpc_duration,
            replies,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn message_sent(&self, pattern: &str) {
        crate::metric_inc!(self.messages_sent, pattern);
    }

    pub fn message_received(&self, pattern: &str) {
        crate::metric_inc!(self.messages_received, pattern);
    }

    /// Count one finished RPC call.
    pub fn rpc_call(&self, outcome: &str) {
        crate::metric_inc!(self.rpc_calls, outcome);
    }

    /// Start timing an RPC call. Observation happens on drop.
    pub fn time_rpc(&self) -> HistogramTimer {
        HistogramTimer::new(&self.rpc_duration)
    }

    /// Publish a reply counter snapshot.
    pub fn record_replies(&self, counts: ReplyCounts) {
        for (kind, value) in [
            ("registered", counts.registered),
            ("dispatched", counts.dispatched),
            ("orphaned", counts.orphaned),
            ("cancelled", counts.cancelled),
        ] {
            self.replies
                .with_label_values(&[kind])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(init_err)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }
}

/// Timer that records elapsed seconds into a histogram when dropped.
pub struct HistogramTimer {
    histogram: Histogram,
    start: Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}
