//! Health, stats and administrative endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::api::routes::{ApiResult, AppState};
use crate::health::{Subsystem, SubsystemStatus};
use crate::models::{ChainInfo, Monitor, MonitorState};
use crate::storage::ClearedCounts;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct AdminHealthResponse {
    status: &'static str,
    checked_at: i64,
    subsystems: Vec<SubsystemStatus>,
    ledger: Value,
    observations_last_24h: Option<u64>,
    snapshots_last_24h: Option<u64>,
    ingest_dev_mode: bool,
}

/// Probes the database and the ledger, then reports every subsystem.
pub async fn admin_health(State(state): State<AppState>) -> Json<AdminHealthResponse> {
    let now = state.now();

    match state.chain.ping() {
        Ok(()) => state.health.record_success(Subsystem::Database, now),
        Err(e) => {
            warn!(error = %e, "Database ping failed");
            state.health.record_failure(Subsystem::Database, now, &e);
        }
    }

    let ledger = match tokio::time::timeout(state.ledger_probe_timeout, state.ledger.chain_info())
        .await
    {
        Ok(Ok(info)) => {
            state.health.record_success(Subsystem::Ledger, now);
            json!({ "genesis_hash": info.genesis_hash, "height": info.height })
        }
        Ok(Err(e)) => {
            state.health.record_failure(Subsystem::Ledger, now, &e);
            json!({ "error": format!("{:#}", e) })
        }
        Err(_) => {
            let msg = format!("probe timed out after {:?}", state.ledger_probe_timeout);
            state.health.record_failure(Subsystem::Ledger, now, &msg);
            json!({ "error": msg })
        }
    };

    let (observations, snapshots) = match state.gateway.freshness(now) {
        Ok((o, s)) => (Some(o), Some(s)),
        Err(e) => {
            warn!(error = %e, "Ingest freshness query failed");
            (None, None)
        }
    };

    let subsystems = state.health.snapshot(now);
    let core_online = subsystems
        .iter()
        .filter(|s| matches!(s.subsystem, Subsystem::Database | Subsystem::Ledger))
        .all(|s| s.online);

    Json(AdminHealthResponse {
        status: if core_online { "ok" } else { "degraded" },
        checked_at: now,
        subsystems,
        ledger,
        observations_last_24h: observations,
        snapshots_last_24h: snapshots,
        ingest_dev_mode: state.gateway.authenticator().is_dev_mode(),
    })
}

#[derive(Serialize)]
pub struct StatsResponse {
    monitors_total: u64,
    monitors_by_state: BTreeMap<&'static str, u64>,
    observations_last_24h: u64,
    snapshots_last_24h: u64,
    chain: Option<ChainInfo>,
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let now = state.now();
    let mut by_state: BTreeMap<&'static str, u64> =
        MonitorState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for (s, count) in state.engine.store().count_by_state()? {
        by_state.insert(s.as_str(), count);
    }
    let (observations, snapshots) = state.gateway.freshness(now)?;

    Ok(Json(StatsResponse {
        monitors_total: by_state.values().sum(),
        monitors_by_state: by_state,
        observations_last_24h: observations,
        snapshots_last_24h: snapshots,
        chain: state.chain.chain_meta()?,
    }))
}

pub async fn clear_database(State(state): State<AppState>) -> ApiResult<ClearedCounts> {
    let cleared = state.chain.clear_monitoring_data()?;
    warn!(
        monitors = cleared.monitors,
        monitor_buckets = cleared.monitor_buckets,
        rain_buckets = cleared.rain_buckets,
        "Monitoring data cleared by admin"
    );
    Ok(Json(cleared))
}

pub async fn reset_monitor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Monitor> {
    let now = state.now();
    Ok(Json(state.engine.reset_monitor(&id, now)?))
}
