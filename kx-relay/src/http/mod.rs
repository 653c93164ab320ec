//! HTTP endpoints for kx-relay.
//!
//! The public router serves the key-exchange protocol behind per-IP
//! admission control. The admin router serves health checks and metrics
//! and is meant to be bound to a private address.

mod admission;
pub mod health;
mod metrics;

use crate::channels::ReadOutcome;
use crate::error::ProtocolError;
use crate::protocol::RelayProtocol;
use crate::server::KeyExchangeRelay;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path};
use axum::http::header::{AsHeaderName, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH, LOCATION};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{middleware, Extension, Json, Router};
use kx_types::{headers, ETag};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the public router.
pub fn build_router(relay: Arc<KeyExchangeRelay>) -> Router {
    let max_payload = relay.config().server.max_payload_bytes;
    let protocol = RelayProtocol::new(relay);

    Router::new()
        .route("/", get(root_handler))
        .route("/new_channel", get(new_channel_handler))
        .route("/report", post(report_handler))
        .route("/:channel", any(channel_handler))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_payload))
        .layer(middleware::from_fn_with_state(
            protocol.clone(),
            admission::admit,
        ))
        .layer(Extension(protocol))
}

/// Build the admin router (`/health`, and `/metrics` when enabled).
pub fn build_admin_router(relay: Arc<KeyExchangeRelay>) -> Router {
    let mut router = Router::new().route("/health", get(health::health_handler));
    if relay.config().admin.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(RelayProtocol::new(relay)))
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };

        let mut response = (status, self.to_string()).into_response();
        if let Self::PreconditionFailed { current } = &self {
            if let Some(value) = etag_header(current) {
                response.headers_mut().insert(ETAG, value);
            }
        }
        response
    }
}

/// Quoted `ETag` header value.
fn etag_header(version: &ETag) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("\"{version}\"")).ok()
}

fn header(map: &HeaderMap, name: impl AsHeaderName) -> Option<&str> {
    map.get(name).and_then(|value| value.to_str().ok())
}

async fn root_handler(Extension(protocol): Extension<RelayProtocol>) -> Response {
    match protocol.health_probe().await {
        Ok(()) => {
            let target = protocol.relay().config().server.root_redirect.clone();
            (StatusCode::MOVED_PERMANENTLY, [(LOCATION, target)]).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn new_channel_handler(
    Extension(protocol): Extension<RelayProtocol>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    let id = protocol
        .new_channel(header(&headers, headers::CLIENT_ID))
        .await?;
    Ok((
        [(headers::CHANNEL, id.to_string())],
        Json(id.to_string()),
    )
        .into_response())
}

async fn channel_handler(
    Extension(protocol): Extension<RelayProtocol>,
    Path(channel): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProtocolError> {
    let client_id = header(&headers, headers::CLIENT_ID);
    match method {
        Method::GET => {
            let outcome = protocol
                .get_channel(&channel, client_id, header(&headers, IF_NONE_MATCH))
                .await?;
            Ok(read_response(outcome))
        }
        Method::PUT => {
            let version = protocol
                .put_channel(&channel, client_id, &body, header(&headers, IF_MATCH))
                .await?;
            let mut response = StatusCode::OK.into_response();
            if let Some(value) = etag_header(&version) {
                response.headers_mut().insert(ETAG, value);
            }
            Ok(response)
        }
        _ if protocol.is_channel_path(&channel) => Err(ProtocolError::MethodNotAllowed),
        _ => Err(ProtocolError::NotFound),
    }
}

fn read_response(outcome: ReadOutcome) -> Response {
    let (mut response, version) = match outcome {
        ReadOutcome::Content { content, version } => (
            (
                [(CONTENT_TYPE, "application/octet-stream")],
                content,
            )
                .into_response(),
            version,
        ),
        ReadOutcome::NotModified { version } => (StatusCode::NOT_MODIFIED.into_response(), version),
    };
    if let Some(value) = etag_header(&version) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}

async fn report_handler(
    Extension(protocol): Extension<RelayProtocol>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ProtocolError> {
    protocol
        .report(
            header(&headers, headers::REPORT_CHANNEL),
            header(&headers, headers::REPORT_LOG),
            &body,
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn not_found() -> ProtocolError {
    ProtocolError::NotFound
}
