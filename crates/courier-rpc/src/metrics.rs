//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{Context, Result};
use courier_common::metrics::SharedRegistry;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

/// Outcome label recorded for each dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    HandlerFailed,
    NoSuchAction,
    DecodeFailed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Handled => "handled",
            DispatchOutcome::HandlerFailed => "handler_failed",
            DispatchOutcome::NoSuchAction => "no_such_action",
            DispatchOutcome::DecodeFailed => "decode_failed",
        }
    }
}

/// Prometheus instruments for RPC clients and dispatchers.
#[derive(Clone)]
pub struct RpcMetrics {
    registry: SharedRegistry,
    requests_total: IntCounterVec,
    replies_total: IntCounterVec,
    timeouts_total: IntCounterVec,
    connection_errors_total: IntCounterVec,
    dispatched_total: IntCounterVec,
    request_seconds: HistogramVec,
}

impl RpcMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("courier_rpc_requests_total", "Requests published by RPC clients"),
            &["queue"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let replies_total = IntCounterVec::new(
            Opts::new("courier_rpc_replies_total", "Correlated replies received"),
            &["queue"],
        )?;
        registry.register(Box::new(replies_total.clone()))?;

        let timeouts_total = IntCounterVec::new(
            Opts::new("courier_rpc_timeouts_total", "Requests that timed out"),
            &["queue"],
        )?;
        registry.register(Box::new(timeouts_total.clone()))?;

        let connection_errors_total = IntCounterVec::new(
            Opts::new(
                "courier_rpc_connection_errors_total",
                "Requests failed by broker connection problems",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(connection_errors_total.clone()))?;

        let dispatched_total = IntCounterVec::new(
            Opts::new(
                "courier_rpc_dispatched_total",
                "Messages processed by dispatchers, by outcome",
            ),
            &["queue", "outcome"],
        )?;
        registry.register(Box::new(dispatched_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let request_seconds = HistogramVec::new(
            HistogramOpts::new(
                "courier_rpc_request_seconds",
                "Latency from publish to correlated reply",
            )
            .buckets(buckets),
            &["queue"],
        )?;
        registry.register(Box::new(request_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            replies_total,
            timeouts_total,
            connection_errors_total,
            dispatched_total,
            request_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_request(&self, queue: &str) {
        self.requests_total.with_label_values(&[queue]).inc();
    }

    pub fn record_reply(&self, queue: &str, elapsed: Duration) {
        self.replies_total.with_label_values(&[queue]).inc();
        self.request_seconds
            .with_label_values(&[queue])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_timeout(&self, queue: &str) {
        self.timeouts_total.with_label_values(&[queue]).inc();
    }

    pub fn record_connection_error(&self, queue: &str) {
        self.connection_errors_total.with_label_values(&[queue]).inc();
    }

    pub fn record_dispatch(&self, queue: &str, outcome: DispatchOutcome) {
        self.dispatched_total
            .with_label_values(&[queue, outcome.as_str()])
            .inc();
    }

    /// Current dispatch count for a queue and outcome.
    pub fn dispatched(&self, queue: &str, outcome: DispatchOutcome) -> u64 {
        self.dispatched_total
            .with_label_values(&[queue, outcome.as_str()])
            .get()
    }

    pub fn timeouts(&self, queue: &str) -> u64 {
        self.timeouts_total.with_label_values(&[queue]).get()
    }

    pub fn connection_errors(&self, queue: &str) -> u64 {
        self.connection_errors_total.with_label_values(&[queue]).get()
    }
}
