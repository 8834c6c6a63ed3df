//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ws_proxy_upgrades_total` (counter): upgrade attempts by `result`
//! - `ws_proxy_active_sessions` (gauge): sessions currently relaying
//! - `ws_proxy_messages_total` (counter): relayed messages by `direction`
//! - `ws_proxy_message_bytes_total` (counter): relayed payload bytes by `direction`
//! - `ws_proxy_pings_intercepted_total` (counter): pings answered by the proxy
//! - `ws_proxy_session_duration_seconds` (histogram): session lifetime
//! - `ws_proxy_backend_connect_seconds` (histogram): backend dial + handshake
//!   time by `result`

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Outcome of one client upgrade request: `accepted` or an error kind.
pub fn record_upgrade(result: &'static str) {
    metrics::counter!("ws_proxy_upgrades_total", "result" => result).increment(1);
}

pub fn session_opened() {
    metrics::gauge!("ws_proxy_active_sessions").increment(1.0);
}

pub fn session_closed() {
    metrics::gauge!("ws_proxy_active_sessions").decrement(1.0);
}

pub fn record_message(direction: &'static str, len: usize) {
    metrics::counter!("ws_proxy_messages_total", "direction" => direction).increment(1);
    metrics::counter!("ws_proxy_message_bytes_total", "direction" => direction)
        .increment(len as u64);
}

pub fn record_ping_intercepted() {
    metrics::counter!("ws_proxy_pings_intercepted_total").increment(1);
}

pub fn record_session_end(duration: Duration) {
    metrics::histogram!("ws_proxy_session_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_backend_connect(ok: bool, elapsed: Duration) {
    let result = if ok { "ok" } else { "error" };
    metrics::histogram!("ws_proxy_backend_connect_seconds", "result" => result)
        .record(elapsed.as_secs_f64());
}
