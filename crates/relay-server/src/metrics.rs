//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const EVENTS_TOTAL: &str = "relay_events_total";
    pub const EVENTS_BYTES: &str = "relay_events_bytes";
    pub const PRESENCE_ONLINE: &str = "relay_presence_online";
    pub const PERSISTENCE_FAILURES_TOTAL: &str = "relay_persistence_failures_total";
    pub const PROTOCOL_ERRORS_TOTAL: &str = "relay_protocol_errors_total";
    pub const LATENCY_SECONDS: &str = "relay_latency_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events by name and direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total encoded bytes of events");
    metrics::describe_gauge!(names::PRESENCE_ONLINE, "Identities currently marked online");
    metrics::describe_counter!(
        names::PERSISTENCE_FAILURES_TOTAL,
        "Store calls that failed, by operation"
    );
    metrics::describe_counter!(
        names::PROTOCOL_ERRORS_TOTAL,
        "Inbound frames rejected, by kind"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );

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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event crossing the wire.
pub fn record_event(event: &'static str, direction: &'static str, bytes: usize) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the online identity count.
pub fn set_presence_online(count: usize) {
    gauge!(names::PRESENCE_ONLINE).set(count as f64);
}

/// Record a failed store call.
pub fn record_persistence_failure(operation: &'static str) {
    counter!(names::PERSISTENCE_FAILURES_TOTAL, "operation" => operation).increment(1);
}

/// Record a rejected inbound frame.
pub fn record_protocol_error(kind: &'static str) {
    counter!(names::PROTOCOL_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
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
        record_disconnection();
    }
}
