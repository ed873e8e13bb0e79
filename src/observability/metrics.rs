//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tls_echo_connections_accepted_total` (counter)
//! - `tls_echo_handshake_failures_total` (counter)
//! - `tls_echo_active_connections` (gauge): approximate, see `Registry`
//! - `tls_echo_bytes_received_total` / `tls_echo_bytes_sent_total` (counters)
//! - `tls_echo_deaf_transitions_total` (counter)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

pub fn record_accepted() {
    metrics::counter!("tls_echo_connections_accepted_total").increment(1);
}

pub fn record_handshake_failure() {
    metrics::counter!("tls_echo_handshake_failures_total").increment(1);
}

pub fn set_active_connections(count: usize) {
    metrics::gauge!("tls_echo_active_connections").set(count as f64);
}

pub fn record_bytes_received(bytes: usize) {
    metrics::counter!("tls_echo_bytes_received_total").increment(bytes as u64);
}

pub fn record_bytes_sent(bytes: usize) {
    metrics::counter!("tls_echo_bytes_sent_total").increment(bytes as u64);
}

pub fn record_deaf() {
    metrics::counter!("tls_echo_deaf_transitions_total").increment(1);
}
