//! Metrics collection and export for Murmur.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::RouterStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "murmur_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "murmur_connections_active";
    pub const AUTH_FAILURES_TOTAL: &str = "murmur_auth_failures_total";
    pub const FRAMES_TOTAL: &str = "murmur_frames_total";
    pub const FRAMES_BYTES: &str = "murmur_frames_bytes";
    pub const ACKS_TOTAL: &str = "murmur_acks_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "murmur_subscriptions_active";
    pub const TOPICS_ACTIVE: &str = "murmur_topics_active";
    pub const ACTION_SECONDS: &str = "murmur_action_seconds";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of authenticated connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::AUTH_FAILURES_TOTAL, "Rejected connect frames");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames by direction and kind");
    metrics::describe_counter!(names::FRAMES_BYTES, "Frame bytes by direction");
    metrics::describe_counter!(names::ACKS_TOTAL, "Acknowledgements by status");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current topic subscriptions across tables"
    );
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Topics with at least one subscriber");
    metrics::describe_histogram!(
        names::ACTION_SECONDS,
        "Action frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a successful connect.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
}

/// Record a rejected connect.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str, kind: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction, "kind" => kind).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an acknowledgement.
pub fn record_ack(status: u16) {
    counter!(names::ACKS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record action handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::ACTION_SECONDS).record(seconds);
}

/// Update subscription gauges.
pub fn set_router_stats(stats: RouterStats) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
    gauge!(names::TOPICS_ACTIVE).set(stats.topic_count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that tracks an open socket until dropped.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
