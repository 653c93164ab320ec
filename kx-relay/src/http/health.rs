//! Health check endpoint.

use crate::protocol::RelayProtocol;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "ok" when the backend answered the probe, "unavailable" otherwise.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Backend in use ("redis" or "memory").
    pub backend: String,
    /// Entries in the local blacklist view.
    pub blacklisted_ips: usize,
    /// Blacklist changes not yet published.
    pub blacklist_dirty: bool,
    /// IPs whose request counters are tracked.
    pub tracked_ips: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler. Answers 503 when the backend probe fails.
pub async fn health_handler(
    Extension(protocol): Extension<RelayProtocol>,
) -> (StatusCode, Json<HealthStatus>) {
    let relay = protocol.relay();
    let (code, status) = match protocol.health_probe().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };

    (
        code,
        Json(HealthStatus {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: relay.backend().name().to_string(),
            blacklisted_ips: relay.blacklist().len().await,
            blacklist_dirty: relay.blacklist().is_dirty().await,
            tracked_ips: relay.limiter().tracked_ips().await,
            uptime_seconds: relay.uptime_secs(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            backend: "redis".to_string(),
            blacklisted_ips: 3,
            blacklist_dirty: false,
            tracked_ips: 42,
            uptime_seconds: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"backend\":\"redis\""));
        assert!(json.contains("\"tracked_ips\":42"));
    }
}
