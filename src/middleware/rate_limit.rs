//! Rate limiting middleware.
//!
//! Fixed-window request counter per client IP, applied to the ingest routes.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
    /// Extra requests tolerated above the limit before rejecting.
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(60),
            burst: 0,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(120)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn check(&self, ip: IpAddr) -> RateDecision {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock();
        let window = windows.entry(ip).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.saturating_duration_since(window.started) >= self.config.window {
            window.count = 0;
            window.started = now;
        }

        let limit = self.config.requests_per_window.saturating_add(self.config.burst);
        if window.count >= limit {
            let resets_at = window.started + self.config.window;
            return RateDecision::Limited {
                retry_after: resets_at.saturating_duration_since(now),
            };
        }
        window.count += 1;
        RateDecision::Allowed {
            remaining: limit - window.count,
        }
    }

    /// Drop windows that ended long ago; run from a background task.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let keep_for = self.config.window * 2;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.started) < keep_for);
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        RateDecision::Allowed { .. } => next.run(request).await,
        RateDecision::Limited { retry_after } => {
            // Round up so clients never retry inside the same window.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            warn!(
                ip = %addr.ip(),
                path = %request.uri().path(),
                retry_after_secs = secs,
                "Rate limit exceeded"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(serde_json::json!({
                    "error": "rate_limit_exceeded",
                    "retry_after_seconds": secs,
                })),
            )
                .into_response()
        }
    }
}
