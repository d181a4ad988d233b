//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): dispatched requests by kind, status
//! - `proxy_request_duration_seconds` (histogram): forwarded round-trip latency
//! - `proxy_in_flight` (gauge): admission slots currently held
//! - `proxy_tunnels_active` (gauge): tunnels in the relaying state
//! - `proxy_tunnel_bytes_total` (counter): bytes relayed by direction
//! - `proxy_dial_failures_total` (counter): failed outbound dials by kind

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(kind: &'static str, status: u16, start: Instant) {
    counter!("proxy_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds", "kind" => kind)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_in_flight(count: usize) {
    gauge!("proxy_in_flight").set(count as f64);
}

pub fn tunnel_opened() {
    gauge!("proxy_tunnels_active").increment(1.0);
}

pub fn tunnel_closed(upstream_bytes: u64, downstream_bytes: u64) {
    gauge!("proxy_tunnels_active").decrement(1.0);
    counter!("proxy_tunnel_bytes_total", "direction" => "upstream").increment(upstream_bytes);
    counter!("proxy_tunnel_bytes_total", "direction" => "downstream").increment(downstream_bytes);
}

pub fn record_dial_failure(kind: &'static str) {
    counter!("proxy_dial_failures_total", "kind" => kind).increment(1);
}
