//! Authenticated ingest of raw observations and aggregate snapshots pushed by
//! the remote reporter.

use crate::health::{HealthTracker, Subsystem};
use crate::ingest::auth::{canonical_json, AuthError, IngestAuthenticator};
use crate::models::{ObservationRecord, SnapshotRecord, UpsertOutcome};
use crate::storage::IngestStore;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

const DAY_SECS: i64 = 86_400;
pub const DEFAULT_OBSERVATION_RETENTION_DAYS: i64 = 30;
pub const DEFAULT_SNAPSHOT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub inserted: usize,
    pub already_present: usize,
    pub rejected_invalid: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Inserted,
    AlreadyPresent,
}

impl From<UpsertOutcome> for SnapshotStatus {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Inserted => SnapshotStatus::Inserted,
            UpsertOutcome::AlreadyPresent => SnapshotStatus::AlreadyPresent,
        }
    }
}

#[derive(Debug)]
pub enum IngestError {
    Unauthorized(AuthError),
    Malformed(String),
    Store(anyhow::Error),
}

impl From<AuthError> for IngestError {
    fn from(e: AuthError) -> Self {
        IngestError::Unauthorized(e)
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(e: anyhow::Error) -> Self {
        IngestError::Store(e)
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::Unauthorized(e) => e.into_response(),
            IngestError::Malformed(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            IngestError::Store(e) => {
                error!("Ingest store error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Parse one batch entry; `None` when a required field is missing or ill-typed.
fn observation_from(sample: &Value, received_at: i64) -> Option<ObservationRecord> {
    let obj = sample.as_object()?;
    let contract_id = str_field(obj, "contract_id")?;
    let epoch_time = obj.get("epoch_time")?.as_i64()?;
    let location_key = str_field(obj, "location_key")?;
    let fields = obj.get("fields").filter(|f| f.is_object())?;

    let sample_hash = match obj.get("sample_hash") {
        None | Some(Value::Null) => {
            let mut unhashed = obj.clone();
            unhashed.remove("sample_hash");
            blake3::hash(canonical_json(&Value::Object(unhashed)).as_bytes())
                .to_hex()
                .to_string()
        }
        Some(Value::String(h)) if !h.is_empty() => h.clone(),
        Some(_) => return None,
    };

    Some(ObservationRecord {
        contract_id: contract_id.to_string(),
        epoch_time,
        location_key: location_key.to_string(),
        fields: fields.clone(),
        sample_hash,
        received_at,
    })
}

fn snapshot_from(body: &Value, received_at: i64) -> Result<SnapshotRecord, IngestError> {
    let malformed = |field: &str| IngestError::Malformed(format!("missing or invalid {}", field));
    let obj = body
        .as_object()
        .ok_or_else(|| IngestError::Malformed("snapshot must be a JSON object".to_string()))?;

    let contract_id = str_field(obj, "contract_id").ok_or_else(|| malformed("contract_id"))?;
    let observed_until = obj
        .get("observed_until")
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("observed_until"))?;
    let agg_state = obj
        .get("agg_state")
        .filter(|v| !v.is_null())
        .ok_or_else(|| malformed("agg_state"))?;
    let commitment = str_field(obj, "commitment").ok_or_else(|| malformed("commitment"))?;

    Ok(SnapshotRecord {
        contract_id: contract_id.to_string(),
        observed_until,
        agg_state: agg_state.clone(),
        commitment: commitment.to_string(),
        received_at,
    })
}

pub struct IngestGateway {
    store: Arc<dyn IngestStore>,
    auth: IngestAuthenticator,
    health: Arc<HealthTracker>,
    observation_retention_days: i64,
    snapshot_retention_days: i64,
}

impl IngestGateway {
    pub fn new(
        store: Arc<dyn IngestStore>,
        auth: IngestAuthenticator,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            store,
            auth,
            health,
            observation_retention_days: DEFAULT_OBSERVATION_RETENTION_DAYS,
            snapshot_retention_days: DEFAULT_SNAPSHOT_RETENTION_DAYS,
        }
    }

    pub fn with_retention(mut self, observation_days: i64, snapshot_days: i64) -> Self {
        self.observation_retention_days = observation_days;
        self.snapshot_retention_days = snapshot_days;
        self
    }

    pub fn authenticator(&self) -> &IngestAuthenticator {
        &self.auth
    }

    /// `{"observations": [...]}`. Bad entries are counted, not fatal.
    pub fn ingest_observations(
        &self,
        headers: &HeaderMap,
        body: &Value,
        now: i64,
    ) -> Result<BatchCounts, IngestError> {
        self.auth.verify(headers, body, now)?;

        let samples = body
            .get("observations")
            .and_then(Value::as_array)
            .ok_or_else(|| IngestError::Malformed("missing observations array".to_string()))?;

        let mut counts = BatchCounts::default();
        for sample in samples {
            let Some(record) = observation_from(sample, now) else {
                counts.rejected_invalid += 1;
                continue;
            };
            match self.store.upsert_observation(&record) {
                Ok(UpsertOutcome::Inserted) => counts.inserted += 1,
                Ok(UpsertOutcome::AlreadyPresent) => counts.already_present += 1,
                Err(e) => {
                    self.health.record_failure(Subsystem::Database, now, &e);
                    return Err(e.into());
                }
            }
        }

        self.health.record_success(Subsystem::Ingest, now);
        debug!(
            inserted = counts.inserted,
            already_present = counts.already_present,
            rejected_invalid = counts.rejected_invalid,
            "Observation batch ingested"
        );
        Ok(counts)
    }

    pub fn ingest_snapshot(
        &self,
        headers: &HeaderMap,
        body: &Value,
        now: i64,
    ) -> Result<SnapshotStatus, IngestError> {
        self.auth.verify(headers, body, now)?;
        let record = snapshot_from(body, now)?;
        let outcome = self.store.upsert_snapshot(&record).map_err(|e| {
            self.health.record_failure(Subsystem::Database, now, &e);
            IngestError::Store(e)
        })?;
        self.health.record_success(Subsystem::Ingest, now);
        debug!(
            contract_id = %record.contract_id,
            observed_until = record.observed_until,
            ?outcome,
            "Snapshot ingested"
        );
        Ok(outcome.into())
    }

    /// Drop observations and snapshots past their retention.
    pub fn prune_expired(&self, now: i64) -> anyhow::Result<(usize, usize)> {
        let (observations, snapshots) = self.store.prune_ingest(
            now - self.observation_retention_days * DAY_SECS,
            now - self.snapshot_retention_days * DAY_SECS,
        )?;
        if observations + snapshots > 0 {
            info!(observations, snapshots, "Expired ingest records pruned");
        }
        Ok((observations, snapshots))
    }

    /// `(observations, snapshots)` received in the last 24h.
    pub fn freshness(&self, now: i64) -> anyhow::Result<(u64, u64)> {
        self.store.ingest_counts_since(now - DAY_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::auth::{signed_headers, SignatureScheme, DEFAULT_WINDOW_SECS};
    use crate::storage::SqliteStore;
    use axum::http::HeaderValue;

    const SECRET: &str = "gateway-unit-secret-0123456789abcdef";
    const NOW: i64 = 1_700_000_000;

    fn gateway() -> IngestGateway {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        IngestGateway::new(
            store,
            IngestAuthenticator::new(SECRET, DEFAULT_WINDOW_SECS, 1_000),
            Arc::new(HealthTracker::new()),
        )
    }

    fn signed(body: &Value, nonce: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in signed_headers(SignatureScheme::HmacSha256, SECRET, body, NOW, nonce) {
            headers.insert(name, HeaderValue::from_str(&value).unwrap());
        }
        headers
    }

    fn batch() -> Value {
        json!({
            "observations": [
                {"contract_id": "c1", "epoch_time": NOW - 60, "location_key": "-1.2921,36.8219",
                 "fields": {"rain_mm": 1.5}},
                {"contract_id": "c1", "epoch_time": NOW - 30, "location_key": "-1.2921,36.8219",
                 "fields": {"rain_mm": 0.0}, "sample_hash": "abc"},
                {"contract_id": "c1", "location_key": "-1.2921,36.8219", "fields": {}},
                {"contract_id": "c1", "epoch_time": "soon", "location_key": "x", "fields": {}},
            ]
        })
    }

    #[test]
    fn test_batch_counts_and_replay_idempotent() {
        let gw = gateway();
        let body = batch();

        let first = gw.ingest_observations(&signed(&body, "n1"), &body, NOW).unwrap();
        assert_eq!(
            first,
            BatchCounts { inserted: 2, already_present: 0, rejected_invalid: 2 }
        );

        let second = gw.ingest_observations(&signed(&body, "n2"), &body, NOW).unwrap();
        assert_eq!(
            second,
            BatchCounts { inserted: 0, already_present: 2, rejected_invalid: 2 }
        );
        assert_eq!(gw.freshness(NOW).unwrap(), (2, 0));
    }

    #[test]
    fn test_replayed_request_is_unauthorized() {
        let gw = gateway();
        let body = batch();
        let headers = signed(&body, "same");
        assert!(gw.ingest_observations(&headers, &body, NOW).is_ok());
        assert!(matches!(
            gw.ingest_observations(&headers, &body, NOW),
            Err(IngestError::Unauthorized(AuthError::ReplayedNonce))
        ));
    }

    #[test]
    fn test_default_sample_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(
            r#"{"contract_id":"c","epoch_time":1,"location_key":"k","fields":{"a":1,"b":2}}"#,
        )
        .unwrap();
        let b: Value = serde_json::from_str(
            r#"{"fields":{"b":2,"a":1},"location_key":"k","epoch_time":1,"contract_id":"c"}"#,
        )
        .unwrap();
        let ra = observation_from(&a, 0).unwrap();
        let rb = observation_from(&b, 0).unwrap();
        assert_eq!(ra.sample_hash, rb.sample_hash);
        assert_eq!(ra.sample_hash.len(), 64);
    }

    #[test]
    fn test_snapshot_upsert_and_validation() {
        let gw = gateway();
        let body = json!({"contract_id": "c1", "observed_until": NOW, "agg_state": {"sum": 12},
                          "commitment": "deadbeef"});
        assert_eq!(
            gw.ingest_snapshot(&signed(&body, "s1"), &body, NOW).unwrap(),
            SnapshotStatus::Inserted
        );
        assert_eq!(
            gw.ingest_snapshot(&signed(&body, "s2"), &body, NOW).unwrap(),
            SnapshotStatus::AlreadyPresent
        );

        let bad = json!({"contract_id": "c1", "agg_state": {}});
        assert!(matches!(
            gw.ingest_snapshot(&signed(&bad, "s3"), &bad, NOW),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn test_retention_prunes_by_received_at() {
        let gw = gateway();
        let body = batch();
        gw.ingest_observations(&signed(&body, "r1"), &body, NOW).unwrap();

        assert_eq!(gw.prune_expired(NOW + 29 * DAY_SECS).unwrap(), (0, 0));
        assert_eq!(gw.prune_expired(NOW + 31 * DAY_SECS).unwrap(), (2, 0));
    }
}
