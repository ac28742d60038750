//! Bearer-token guard for the admin routes.
//!
//! When no admin token is configured the routes are open (dev setups).

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Default)]
pub struct AdminToken(pub Option<Arc<str>>);

impl AdminToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()).map(Arc::from))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdminAuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AdminAuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AdminAuthError::MissingToken => "Missing admin token. Use: Authorization: Bearer {token}",
            AdminAuthError::InvalidToken => "Invalid admin token",
        };
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
    }
}

/// Both tokens are MACed under `expected`; the tags are compared in constant
/// time.
fn tokens_match(given: &str, expected: &str) -> bool {
    let tag = |token: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    match (tag(given), tag(expected)) {
        (Ok(given), Ok(expected)) => given
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

pub async fn admin_auth(
    State(token): State<AdminToken>,
    req: Request,
    next: Next,
) -> Result<Response, AdminAuthError> {
    let Some(expected) = token.0.as_deref() else {
        return Ok(next.run(req).await);
    };

    let given = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AdminAuthError::MissingToken)?;

    if !tokens_match(given.trim(), expected) {
        return Err(AdminAuthError::InvalidToken);
    }
    Ok(next.run(req).await)
}
