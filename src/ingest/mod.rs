//! Authenticated ingest gateway
//!
//! - `auth`: signed-request verification and canonical JSON
//! - `nonce`: windowed replay cache
//! - `gateway`: observation/snapshot upserts and retention

pub mod auth;
pub mod gateway;
pub mod nonce;

pub use auth::{
    canonical_json, signed_headers, AuthError, IngestAuthenticator, SignatureScheme,
    DEFAULT_WINDOW_SECS, PRODUCTION_WINDOW_SECS,
};
pub use gateway::{BatchCounts, IngestError, IngestGateway, SnapshotStatus};
pub use nonce::NonceCache;
