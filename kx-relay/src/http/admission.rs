//! Per-IP admission control in front of every public route.

use crate::error::ProtocolError;
use crate::protocol::RelayProtocol;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

/// Reject blacklisted IPs, then count the request and its outcome.
pub async fn admit(
    State(protocol): State<RelayProtocol>,
    request: Request,
    next: Next,
) -> Response {
    let relay = protocol.relay();
    let ip = client_ip(&request, relay.config().server.trust_proxy_headers);
    let limiter = relay.limiter();

    if limiter.is_blocked(&ip).await {
        relay
            .metrics()
            .blocked_requests
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Rejected request from blacklisted {}", ip);
        return ProtocolError::Forbidden.into_response();
    }

    if limiter.record_attempt(&ip).await {
        relay
            .metrics()
            .blacklist_promotions
            .fetch_add(1, Ordering::Relaxed);
        return ProtocolError::Forbidden.into_response();
    }

    let response = next.run(request).await;

    if is_bad_request(response.status()) && limiter.record_bad_request(&ip).await {
        relay
            .metrics()
            .blacklist_promotions
            .fetch_add(1, Ordering::Relaxed);
    }
    response
}

fn is_bad_request(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED
    )
}

/// Address the request is attributed to.
///
/// With `trust_proxy` the first `X-Forwarded-For` hop wins over the
/// socket peer.
fn client_ip(request: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
