//! Prometheus metrics endpoint.

use crate::protocol::RelayProtocol;
use crate::server::RelayMetrics;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(protocol): Extension<RelayProtocol>) -> impl IntoResponse {
    let relay = protocol.relay();

    // Gauges
    let blacklisted = relay.blacklist().len().await;
    let tracked = relay.limiter().tracked_ips().await;
    let uptime = relay.uptime_secs();

    let mut body = format!(
        r#"# HELP kx_relay_info Server information
# TYPE kx_relay_info gauge
kx_relay_info{{version="{version}",backend="{backend}"}} 1

# HELP kx_relay_blacklisted_ips Entries in the local blacklist view
# TYPE kx_relay_blacklisted_ips gauge
kx_relay_blacklisted_ips {blacklisted}

# HELP kx_relay_tracked_ips IPs whose request counters are tracked
# TYPE kx_relay_tracked_ips gauge
kx_relay_tracked_ips {tracked}

# HELP kx_relay_uptime_seconds Seconds since startup
# TYPE kx_relay_uptime_seconds gauge
kx_relay_uptime_seconds {uptime}
"#,
        version = env!("CARGO_PKG_VERSION"),
        backend = relay.backend().name(),
    );

    for (name, help, counter) in counters(relay.metrics()) {
        let _ = write!(
            body,
            "\n# HELP kx_relay_{name}_total {help}\n# TYPE kx_relay_{name}_total counter\nkx_relay_{name}_total {}\n",
            counter.load(Ordering::Relaxed)
        );
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn counters(m: &RelayMetrics) -> [(&'static str, &'static str, &AtomicU64); 10] {
    [
        ("channels_created", "Channels created", &m.channels_created),
        ("reads", "Channel reads that returned content", &m.reads_total),
        ("not_modified", "Channel reads answered with 304", &m.not_modified_total),
        ("writes", "Successful channel writes", &m.writes_total),
        ("conflicts", "Channel writes rejected with 412", &m.conflicts_total),
        ("teardowns", "Channels closed by poll ceiling or third participant", &m.teardowns_total),
        ("reports", "Client reports received", &m.reports_total),
        ("blocked_requests", "Requests rejected from blacklisted IPs", &m.blocked_requests),
        ("blacklist_promotions", "IPs blacklisted by this instance", &m.blacklist_promotions),
        ("backend_errors", "Requests failed on the backend", &m.backend_errors),
    ]
}
