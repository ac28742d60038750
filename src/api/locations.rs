//! Direct access to the per-location rolling aggregate and the coverage
//! window evaluator.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::aggregator::{Crossing, SubmitOutcome};
use crate::api::routes::{ApiResult, AppState};
use crate::models::{RainBucket, RollingWindowState};

#[derive(Serialize)]
pub struct RollingResponse {
    location_id: String,
    state: Option<RollingWindowState>,
    /// Recomputed from the stored buckets at request time.
    window_total_tenths_mm: u64,
    buckets: Vec<RainBucket>,
}

pub async fn rolling(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
) -> ApiResult<RollingResponse> {
    let now = state.now();
    let aggregator = state.engine.aggregator();
    Ok(Json(RollingResponse {
        state: aggregator.rolling_state(&location_id)?,
        window_total_tenths_mm: aggregator.window_total(&location_id, now)?,
        buckets: aggregator.buckets(&location_id)?,
        location_id,
    }))
}

#[derive(Deserialize)]
pub struct SampleRequest {
    timestamp: i64,
    rainfall_tenths_mm: u32,
}

pub async fn submit_sample(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
    Json(req): Json<SampleRequest>,
) -> ApiResult<SubmitOutcome> {
    let now = state.now();
    let outcome = state.engine.aggregator().submit_sample(
        &location_id,
        req.timestamp,
        req.rainfall_tenths_mm,
        now,
    )?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct CrossedQuery {
    strike: u32,
    start: i64,
    end: i64,
}

#[derive(Serialize)]
pub struct CrossedResponse {
    crossed: bool,
    first_crossing: Option<Crossing>,
}

pub async fn crossed(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
    Query(q): Query<CrossedQuery>,
) -> ApiResult<CrossedResponse> {
    let first = state
        .evaluator
        .first_crossing(&location_id, q.strike, q.start, q.end)?;
    Ok(Json(CrossedResponse {
        crossed: first.is_some(),
        first_crossing: first,
    }))
}
