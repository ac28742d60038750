//! Signed ingest endpoints.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::api::routes::AppState;
use crate::ingest::{BatchCounts, IngestError};

pub async fn observations_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<BatchCounts>, IngestError> {
    let now = state.now();
    let counts = state.gateway.ingest_observations(&headers, &body, now)?;
    Ok(Json(counts))
}

pub async fn snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, IngestError> {
    let now = state.now();
    let status = state.gateway.ingest_snapshot(&headers, &body, now)?;
    Ok(Json(json!({ "status": status })))
}
