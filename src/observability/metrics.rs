//! Metrics collection and exposition.
//!
//! # Metrics
//! - `host_router_requests_total` (counter): finished requests by method, status
//! - `host_router_request_duration_seconds` (histogram): pipeline latency
//! - `host_router_redirects_total` (counter): internal redirect hops
//! - `host_router_workloads_total` (counter): owning-thread workloads by kind, outcome
//! - `host_router_ws_sessions` (gauge): connected WebSocket sessions
//! - `host_router_registry_changes_total` (counter): endpoint registrations/removals
//!
//! # Design Decisions
//! - Recording is a no-op until [`init_metrics`] installs the exporter
//! - Labels stay low-cardinality (no paths)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: i32, start: Instant) {
    let status = status.to_string();
    counter!(
        "host_router_requests_total",
        "method" => method.to_string(),
        "status" => status.clone()
    )
    .increment(1);
    histogram!(
        "host_router_request_duration_seconds",
        "method" => method.to_string(),
        "status" => status
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_redirect() {
    counter!("host_router_redirects_total").increment(1);
}

pub fn record_workload(kind: &'static str, outcome: &'static str) {
    counter!("host_router_workloads_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_ws_session_opened() {
    gauge!("host_router_ws_sessions").increment(1.0);
}

pub fn record_ws_session_closed() {
    gauge!("host_router_ws_sessions").decrement(1.0);
}

pub fn record_registry_change(action: &'static str, count: usize) {
    counter!("host_router_registry_changes_total", "action" => action).increment(count as u64);
}
