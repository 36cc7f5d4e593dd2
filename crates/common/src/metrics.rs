//! Metrics collection for Toolgate
//!
//! This module provides Prometheus metrics for observability.
//! Everything is recorded from the supervisor task, so the hot path is a
//! handful of atomic increments per request.

use lazy_static::lazy_static;
use prometheus::{Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for Toolgate
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub worker: WorkerMetrics,
}

/// Request queue and dispatch metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of enqueued requests
    pub enqueued_total: IntCounter,

    /// Completed requests by outcome (`success` or an error kind)
    pub completed_total: IntCounterVec,

    /// Time from enqueue to completion
    pub request_duration: Histogram,

    /// Time spent queued before dispatch
    pub queue_wait: Histogram,

    /// Current queue depth
    pub queue_depth: IntGauge,

    /// Requests currently awaiting a worker reply (0 or 1)
    pub in_flight: IntGauge,

    /// Replies dropped because their request was no longer in flight
    pub late_replies_discarded: IntCounter,
}

/// Worker lifecycle metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Worker processes started
    pub spawns_total: IntCounter,

    /// Worker processes that exited
    pub exits_total: IntCounter,

    /// 1 while the worker is healthy
    pub healthy: IntGauge,

    /// Delay before the pending respawn
    pub restart_backoff_seconds: Gauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Request metrics
        let enqueued_total = IntCounter::new(
            "toolgate_requests_enqueued_total",
            "Total number of requests enqueued for the worker"
        ).unwrap();

        let completed_total = IntCounterVec::new(
            Opts::new(
                "toolgate_requests_completed_total",
                "Total number of completed requests by outcome"
            ),
            &["outcome"]
        ).unwrap();

        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "toolgate_request_duration_seconds",
                "Request duration from enqueue to completion in seconds"
            ).buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
        ).unwrap();

        let queue_wait = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "toolgate_queue_wait_seconds",
                "Time requests spend queued before dispatch"
            ).buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0])
        ).unwrap();

        let queue_depth = IntGauge::new(
            "toolgate_queue_depth",
            "Current depth of the request queue"
        ).unwrap();

        let in_flight = IntGauge::new(
            "toolgate_requests_in_flight",
            "Requests written to the worker and awaiting a reply"
        ).unwrap();

        let late_replies_discarded = IntCounter::new(
            "toolgate_late_replies_discarded_total",
            "Worker replies discarded because no matching request was in flight"
        ).unwrap();

        // Worker metrics
        let spawns_total = IntCounter::new(
            "toolgate_worker_spawns_total",
            "Total number of worker processes started"
        ).unwrap();

        let exits_total = IntCounter::new(
            "toolgate_worker_exits_total",
            "Total number of worker process exits"
        ).unwrap();

        let healthy = IntGauge::new(
            "toolgate_worker_healthy",
            "Whether the worker is currently healthy"
        ).unwrap();

        let restart_backoff_seconds = Gauge::new(
            "toolgate_worker_restart_backoff_seconds",
            "Delay before the scheduled worker respawn"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(enqueued_total.clone())).unwrap();
        registry.register(Box::new(completed_total.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(queue_wait.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(in_flight.clone())).unwrap();
        registry.register(Box::new(late_replies_discarded.clone())).unwrap();

        registry.register(Box::new(spawns_total.clone())).unwrap();
        registry.register(Box::new(exits_total.clone())).unwrap();
        registry.register(Box::new(healthy.clone())).unwrap();
        registry.register(Box::new(restart_backoff_seconds.clone())).unwrap();

        let requests = RequestMetrics {
            enqueued_total,
            completed_total,
            request_duration,
            queue_wait,
            queue_depth,
            in_flight,
            late_replies_discarded,
        };

        let worker = WorkerMetrics {
            spawns_total,
            exits_total,
            healthy,
            restart_backoff_seconds,
        };

        MetricsRegistry {
            registry,
            requests,
            worker,
        }
    }

    /// Record a completed request
    pub fn record_completion(&self, outcome: &str, elapsed_secs: f64) {
        self.requests
            .completed_total
            .with_label_values(&[outcome])
            .inc();
        self.requests.request_duration.observe(elapsed_secs);
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
