//! Request logging middleware.
//!
//! Every request runs inside an `http_request` span; completion is logged at a
//! level chosen by status class.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health probes are polled constantly.
    if path == "/health" {
        return next.run(request).await;
    }

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    async move {
        let start = Instant::now();
        let response = next.run(request).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        if status.is_server_error() {
            warn!(status = status.as_u16(), latency_ms, "Request failed (5xx)");
        } else if status.is_client_error() {
            info!(status = status.as_u16(), latency_ms, "Request rejected (4xx)");
        } else {
            debug!(status = status.as_u16(), latency_ms, "Request completed");
        }
        response
    }
    .instrument(span)
    .await
}
