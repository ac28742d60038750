use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::aggregator::{CoverageError, CoverageWindowEvaluator, SampleRejection};
use crate::api::{admin, ingest, locations, monitors};
use crate::health::HealthTracker;
use crate::ingest::{IngestAuthenticator, IngestGateway};
use crate::middleware::{
    admin_auth, rate_limit_middleware, request_logging, AdminToken, RateLimiter,
};
use crate::monitor::{MonitorEngine, MonitorNotFound, ReportSigner, TransitionError};
use crate::scheduler::Clock;
use crate::storage::{ChainMetaStore, RainBucketStore, SqliteStore};
use crate::upstream::{SettlementLedger, WeatherProvider};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MonitorEngine>,
    pub gateway: Arc<IngestGateway>,
    pub evaluator: Arc<CoverageWindowEvaluator<dyn RainBucketStore>>,
    pub chain: Arc<dyn ChainMetaStore>,
    pub ledger: Arc<dyn SettlementLedger>,
    pub health: Arc<HealthTracker>,
    pub clock: Clock,
    pub ledger_probe_timeout: Duration,
}

impl AppState {
    pub fn now(&self) -> i64 {
        (self.clock)()
    }
}

/// Everything needed to wire the shared state around one SQLite store.
pub struct AppServices {
    pub store: Arc<SqliteStore>,
    pub weather: Arc<dyn WeatherProvider>,
    pub ledger: Arc<dyn SettlementLedger>,
    pub signer: ReportSigner,
    pub auth: IngestAuthenticator,
    pub clock: Clock,
    /// `(observations, snapshots)` retention in days.
    pub retention_days: (i64, i64),
    pub ledger_probe_timeout: Duration,
}

impl AppServices {
    pub fn into_state(self) -> AppState {
        let health = Arc::new(HealthTracker::new());
        let rain: Arc<dyn RainBucketStore> = self.store.clone();
        let engine = MonitorEngine::new(
            self.store.clone(),
            rain.clone(),
            self.weather,
            self.ledger.clone(),
            self.signer,
            health.clone(),
        );
        let gateway = IngestGateway::new(self.store.clone(), self.auth, health.clone())
            .with_retention(self.retention_days.0, self.retention_days.1);

        AppState {
            engine: Arc::new(engine),
            gateway: Arc::new(gateway),
            evaluator: Arc::new(CoverageWindowEvaluator::new(rain)),
            chain: self.store,
            ledger: self.ledger,
            health,
            clock: self.clock,
            ledger_probe_timeout: self.ledger_probe_timeout,
        }
    }
}

/// Create the API router. Needs `ConnectInfo<SocketAddr>` for rate limiting.
pub fn create_router(state: AppState, limiter: RateLimiter, admin_token: AdminToken) -> Router {
    let ingest_routes = Router::new()
        .route("/ingest/observations/batch", post(ingest::observations_batch))
        .route("/ingest/snapshots", post(ingest::snapshot))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    let admin_routes = Router::new()
        .route("/admin/health", get(admin::admin_health))
        .route("/admin/clear-database", post(admin::clear_database))
        .route("/admin/monitors/:id/reset", post(admin::reset_monitor))
        // Writes straight into the rolling aggregate.
        .route("/locations/:id/samples", post(locations::submit_sample))
        .route_layer(middleware::from_fn_with_state(admin_token, admin_auth));

    Router::new()
        .route("/health", get(admin::health))
        .route("/stats", get(admin::stats))
        .route("/monitors", get(monitors::list_monitors))
        .route("/monitors/trigger-all", post(monitors::trigger_all))
        .route("/monitors/:id", get(monitors::get_monitor))
        .route("/monitors/:id/buckets", get(monitors::monitor_buckets))
        .route("/monitors/:id/audit", get(monitors::monitor_audit))
        .route("/monitors/:id/backfill", post(monitors::backfill))
        .route("/monitors/:id/trigger", post(monitors::trigger))
        .route("/locations/:id/rolling", get(locations::rolling))
        .route("/locations/:id/crossed", get(locations::crossed))
        .merge(ingest_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest { code: &'static str, message: String },
    Conflict(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<MonitorNotFound>() {
            return ApiError::NotFound(e.to_string());
        }
        if let Some(e) = err.downcast_ref::<SampleRejection>() {
            return ApiError::BadRequest {
                code: e.code(),
                message: e.to_string(),
            };
        }
        if let Some(e) = err.downcast_ref::<CoverageError>() {
            return ApiError::BadRequest {
                code: "invalid_coverage_window",
                message: e.to_string(),
            };
        }
        if let Some(e) = err.downcast_ref::<TransitionError>() {
            return ApiError::Conflict(e.to_string());
        }
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::BadRequest { code, message } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": message, "code": code }),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
pub struct ListResponse<T: Serialize> {
    pub count: usize,
    pub items: Vec<T>,
}

impl<T: Serialize> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}
