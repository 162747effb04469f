//! Metrics and observability utilities
//!
//! Prometheus metrics with standardized naming for the evaluation
//! lifecycle, throttling decisions, and notification delivery.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, histogram, Unit,
};
use std::time::Instant;

/// Metrics prefix for all RiskVet metrics
pub const METRICS_PREFIX: &str = "riskvet";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.00,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Evaluation lifecycle metrics
    describe_counter!(
        format!("{}_evaluations_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total evaluations created"
    );

    describe_counter!(
        format!("{}_evaluations_completed_total", METRICS_PREFIX),
        Unit::Count,
        "Total evaluations reaching completed"
    );

    describe_counter!(
        format!("{}_evaluations_failed_total", METRICS_PREFIX),
        Unit::Count,
        "Total evaluations reaching failed"
    );

    describe_counter!(
        format!("{}_evaluations_swept_total", METRICS_PREFIX),
        Unit::Count,
        "Stale in_progress evaluations failed by the sweeper"
    );

    describe_counter!(
        format!("{}_transition_conflicts_total", METRICS_PREFIX),
        Unit::Count,
        "Lifecycle writes rejected by the optimistic version check"
    );

    // Throttling metrics
    describe_counter!(
        format!("{}_quota_denials_total", METRICS_PREFIX),
        Unit::Count,
        "Requests denied by tenant quotas"
    );

    describe_counter!(
        format!("{}_rate_limited_total", METRICS_PREFIX),
        Unit::Count,
        "Requests rejected by per-key rate limiting"
    );

    // Notification metrics
    describe_counter!(
        format!("{}_notifications_enqueued_total", METRICS_PREFIX),
        Unit::Count,
        "Notification rows enqueued"
    );

    describe_counter!(
        format!("{}_notifications_sent_total", METRICS_PREFIX),
        Unit::Count,
        "Notifications delivered"
    );

    describe_counter!(
        format!("{}_notifications_failed_total", METRICS_PREFIX),
        Unit::Count,
        "Notification delivery attempts that failed"
    );

    describe_gauge!(
        format!("{}_notifications_queue_depth", METRICS_PREFIX),
        Unit::Count,
        "Deliverable notification rows"
    );

    // Database metrics
    describe_histogram!(
        format!("{}_db_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Database query latency in seconds"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}
