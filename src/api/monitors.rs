//! Monitor inspection and manual evaluation endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::routes::{ApiError, ApiResult, AppState, ListResponse};
use crate::models::{hour_floor, Monitor, MonitorAuditEntry, MonitorBucket, MonitorState};
use crate::monitor::{BackfillReport, CycleSummary, EvaluationOutcome};

#[derive(Deserialize)]
pub struct MonitorQuery {
    /// Filter by state ("monitoring", "triggered", "matured", "reported")
    state: Option<String>,
}

pub async fn list_monitors(
    State(state): State<AppState>,
    Query(params): Query<MonitorQuery>,
) -> ApiResult<ListResponse<Monitor>> {
    let filter = match params.state.as_deref() {
        None => None,
        Some(raw) => Some(
            MonitorState::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown state '{}'", raw)))?,
        ),
    };
    let monitors = state.engine.store().monitors(filter)?;
    Ok(Json(monitors.into()))
}

pub async fn get_monitor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Monitor> {
    Ok(Json(state.engine.monitor(&id)?))
}

pub async fn monitor_buckets(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ListResponse<MonitorBucket>> {
    let monitor = state.engine.monitor(&id)?;
    let buckets = state.engine.store().monitor_buckets(
        &monitor.id,
        hour_floor(monitor.coverage_start),
        monitor.coverage_end,
    )?;
    Ok(Json(buckets.into()))
}

pub async fn monitor_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ListResponse<MonitorAuditEntry>> {
    let monitor = state.engine.monitor(&id)?;
    Ok(Json(state.engine.store().audit_trail(&monitor.id)?.into()))
}

pub async fn backfill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<BackfillReport> {
    let now = state.now();
    Ok(Json(state.engine.backfill(&id, now).await?))
}

/// Evaluate one monitor regardless of its state. Only `monitoring` monitors
/// can transition.
pub async fn trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<EvaluationOutcome> {
    let now = state.now();
    Ok(Json(state.engine.evaluate_monitor(&id, now).await?))
}

pub async fn trigger_all(State(state): State<AppState>) -> ApiResult<CycleSummary> {
    let now = state.now();
    Ok(Json(state.engine.run_cycle(now).await?))
}
