//! Signed-request authentication for the ingest endpoints.
//!
//! Each request carries `signature`, `timestamp` and `nonce` headers. The
//! signature is checked against an ordered list of schemes; any match accepts.

use crate::ingest::nonce::NonceCache;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::fmt;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "signature";
pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const NONCE_HEADER: &str = "nonce";

pub const DEFAULT_WINDOW_SECS: i64 = 300;
pub const PRODUCTION_WINDOW_SECS: i64 = 120;
pub const MIN_STRICT_SECRET_LEN: usize = 32;

/// Values at or above this are unix milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

const PLACEHOLDER_MARKERS: &[&str] = &[
    "changeme",
    "change-me",
    "change_me",
    "placeholder",
    "your-",
    "your_",
];

/// Compact JSON with object keys sorted lexicographically at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Seconds or milliseconds, normalized to seconds.
pub fn normalize_timestamp(ts: i64) -> i64 {
    if ts >= MILLIS_THRESHOLD {
        ts / 1_000
    } else {
        ts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// BLAKE3 over `secret ∥ body ∥ timestamp ∥ nonce`, as the ledger signs.
    Blake3Native,
    /// HMAC-SHA256 keyed by the secret over `body ∥ timestamp ∥ nonce`.
    HmacSha256,
}

impl SignatureScheme {
    pub const ORDERED: [SignatureScheme; 2] =
        [SignatureScheme::Blake3Native, SignatureScheme::HmacSha256];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureScheme::Blake3Native => "blake3",
            SignatureScheme::HmacSha256 => "hmac-sha256",
        }
    }

    pub fn sign(&self, secret: &str, canonical: &str, timestamp: &str, nonce: &str) -> String {
        match self {
            SignatureScheme::Blake3Native => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(secret.as_bytes());
                hasher.update(canonical.as_bytes());
                hasher.update(timestamp.as_bytes());
                hasher.update(nonce.as_bytes());
                hasher.finalize().to_hex().to_string()
            }
            SignatureScheme::HmacSha256 => match hmac_for(secret, canonical, timestamp, nonce) {
                Some(mac) => hex::encode(mac.finalize().into_bytes()),
                None => String::new(),
            },
        }
    }

    pub fn verify(
        &self,
        secret: &str,
        canonical: &str,
        timestamp: &str,
        nonce: &str,
        signature: &str,
    ) -> bool {
        match self {
            SignatureScheme::Blake3Native => {
                let Ok(given) = blake3::Hash::from_hex(signature) else {
                    return false;
                };
                let mut hasher = blake3::Hasher::new();
                hasher.update(secret.as_bytes());
                hasher.update(canonical.as_bytes());
                hasher.update(timestamp.as_bytes());
                hasher.update(nonce.as_bytes());
                // Hash equality is constant-time.
                hasher.finalize() == given
            }
            SignatureScheme::HmacSha256 => {
                let Ok(given) = hex::decode(signature) else {
                    return false;
                };
                match hmac_for(secret, canonical, timestamp, nonce) {
                    Some(mac) => mac.verify_slice(&given).is_ok(),
                    None => false,
                }
            }
        }
    }
}

fn hmac_for(secret: &str, canonical: &str, timestamp: &str, nonce: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(canonical.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(nonce.as_bytes());
    Some(mac)
}

/// Ingest auth error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader(&'static str),
    InvalidTimestamp,
    StaleTimestamp { skew_secs: i64 },
    InvalidSignature,
    ReplayedNonce,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingHeader(name) => write!(f, "missing {} header", name),
            AuthError::InvalidTimestamp => f.write_str("invalid timestamp header"),
            AuthError::StaleTimestamp { skew_secs } => {
                write!(f, "timestamp outside window (skew {}s)", skew_secs)
            }
            AuthError::InvalidSignature => f.write_str("invalid signature"),
            AuthError::ReplayedNonce => f.write_str("nonce already used"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Returns a description of why `secret` is unfit for strict mode.
pub fn strict_secret_problem(secret: &str) -> Option<String> {
    if secret.len() < MIN_STRICT_SECRET_LEN {
        return Some(format!(
            "ingest secret must be at least {} characters",
            MIN_STRICT_SECRET_LEN
        ));
    }
    let lowered = secret.to_ascii_lowercase();
    if PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some("ingest secret looks like a placeholder".to_string());
    }
    None
}

pub struct IngestAuthenticator {
    secret: String,
    window_secs: i64,
    dev_mode: bool,
    schemes: Vec<SignatureScheme>,
    nonces: NonceCache,
}

impl IngestAuthenticator {
    pub fn new(secret: impl Into<String>, window_secs: i64, nonce_prune_threshold: usize) -> Self {
        Self {
            secret: secret.into(),
            window_secs,
            dev_mode: false,
            schemes: SignatureScheme::ORDERED.to_vec(),
            nonces: NonceCache::new(window_secs, nonce_prune_threshold),
        }
    }

    /// Accept every request unchecked.
    pub fn dev_mode(mut self, enabled: bool) -> Self {
        self.dev_mode = enabled;
        self
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Check headers against the canonical body. Signature is verified before
    /// the nonce is recorded, so forged requests cannot burn nonces.
    pub fn verify(&self, headers: &HeaderMap, body: &Value, now: i64) -> Result<(), AuthError> {
        if self.dev_mode {
            debug!("Ingest auth bypassed (dev mode)");
            return Ok(());
        }

        let signature = header(headers, SIGNATURE_HEADER)?;
        let timestamp_raw = header(headers, TIMESTAMP_HEADER)?;
        let nonce = header(headers, NONCE_HEADER)?;

        let ts = timestamp_raw
            .trim()
            .parse::<i64>()
            .map_err(|_| AuthError::InvalidTimestamp)?;
        let signed_at = normalize_timestamp(ts);
        let skew = now - signed_at;
        if skew.abs() > self.window_secs {
            return Err(AuthError::StaleTimestamp { skew_secs: skew });
        }

        let canonical = canonical_json(body);
        let matched = self.schemes.iter().find(|scheme| {
            scheme.verify(&self.secret, &canonical, timestamp_raw, nonce, signature)
        });
        let Some(scheme) = matched else {
            return Err(AuthError::InvalidSignature);
        };

        if !self.nonces.check_and_record(nonce, signed_at, now) {
            return Err(AuthError::ReplayedNonce);
        }

        debug!(scheme = scheme.as_str(), "Ingest request authenticated");
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingHeader(name))
}

/// Produce the three auth headers for `body`; used by clients and tests.
pub fn signed_headers(
    scheme: SignatureScheme,
    secret: &str,
    body: &Value,
    timestamp: i64,
    nonce: &str,
) -> Vec<(&'static str, String)> {
    let ts = timestamp.to_string();
    let signature = scheme.sign(secret, &canonical_json(body), &ts, nonce);
    vec![
        (SIGNATURE_HEADER, signature),
        (TIMESTAMP_HEADER, ts),
        (NONCE_HEADER, nonce.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "an-ingest-secret-that-is-long-enough-0123";
    const NOW: i64 = 1_700_000_000;

    fn headers_for(scheme: SignatureScheme, body: &Value, ts: i64, nonce: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in signed_headers(scheme, SECRET, body, ts, nonce) {
            headers.insert(name, HeaderValue::from_str(&value).unwrap());
        }
        headers
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [1, {"y": true, "x": null}], "c": "s\"q"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"s\"q","z":[1,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn test_both_schemes_accepted() {
        let auth = IngestAuthenticator::new(SECRET, DEFAULT_WINDOW_SECS, 100);
        let body = json!({"contract_id": "1", "samples": []});
        for (i, scheme) in SignatureScheme::ORDERED.iter().enumerate() {
            let headers = headers_for(*scheme, &body, NOW, &format!("nonce-{}", i));
            assert_eq!(auth.verify(&headers, &body, NOW), Ok(()), "{:?}", scheme);
        }
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let auth = IngestAuthenticator::new(SECRET, DEFAULT_WINDOW_SECS, 100);
        let signed = json!({"a": 1, "b": 2});
        let received: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let headers = headers_for(SignatureScheme::HmacSha256, &signed, NOW, "n");
        assert_eq!(auth.verify(&headers, &received, NOW), Ok(()));
    }

    #[test]
    fn test_missing_headers() {
        let auth = IngestAuthenticator::new(SECRET, DEFAULT_WINDOW_SECS, 100);
        let body = json!({});
        let mut headers = headers_for(SignatureScheme::Blake3Native, &body, NOW, "n");
        headers.remove(NONCE_HEADER);
        assert_eq!(
            auth.verify(&headers, &body, NOW),
            Err(AuthError::MissingHeader(NONCE_HEADER))
        );
        assert_eq!(
            auth.verify(&HeaderMap::new(), &body, NOW),
            Err(AuthError::MissingHeader(SIGNATURE_HEADER))
        );
    }

    #[test]
    fn test_timestamp_window_and_millis() {
        let auth = IngestAuthenticator::new(SECRET, PRODUCTION_WINDOW_SECS, 100);
        let body = json!({"k": "v"});

        let stale = headers_for(SignatureScheme::HmacSha256, &body, NOW - 121, "a");
        assert!(matches!(
            auth.verify(&stale, &body, NOW),
            Err(AuthError::StaleTimestamp { skew_secs: 121 })
        ));

        let millis = headers_for(SignatureScheme::HmacSha256, &body, (NOW - 60) * 1_000, "b");
        assert_eq!(auth.verify(&millis, &body, NOW), Ok(()));
    }

    #[test]
    fn test_tampered_body_and_replay() {
        let auth = IngestAuthenticator::new(SECRET, DEFAULT_WINDOW_SECS, 100);
        let body = json!({"rain": 10});
        let headers = headers_for(SignatureScheme::Blake3Native, &body, NOW, "once");

        assert_eq!(
            auth.verify(&headers, &json!({"rain": 11}), NOW),
            Err(AuthError::InvalidSignature)
        );
        // The forged attempt did not consume the nonce.
        assert_eq!(auth.verify(&headers, &body, NOW), Ok(()));
        assert_eq!(
            auth.verify(&headers, &body, NOW + 1),
            Err(AuthError::ReplayedNonce)
        );
    }

    #[test]
    fn test_replay_with_future_timestamp_rejected() {
        let auth = IngestAuthenticator::new(SECRET, DEFAULT_WINDOW_SECS, 100);
        let body = json!({"rain": 10});
        let ts = NOW + 200;
        let headers = headers_for(SignatureScheme::Blake3Native, &body, ts, "ahead");

        // First use while the signer's clock runs ahead of ours.
        assert_eq!(auth.verify(&headers, &body, NOW), Ok(()));
        // 350s later the timestamp is still inside the window.
        assert_eq!(
            auth.verify(&headers, &body, NOW + 350),
            Err(AuthError::ReplayedNonce)
        );
    }

    #[test]
    fn test_dev_mode_skips_everything() {
        let auth = IngestAuthenticator::new("", DEFAULT_WINDOW_SECS, 100).dev_mode(true);
        assert_eq!(auth.verify(&HeaderMap::new(), &json!(null), NOW), Ok(()));
    }

    #[test]
    fn test_strict_secret_rules() {
        assert!(strict_secret_problem("short").is_some());
        assert!(strict_secret_problem("changeme-changeme-changeme-changeme").is_some());
        assert!(strict_secret_problem(SECRET).is_none());
    }
}
