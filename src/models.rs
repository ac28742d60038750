use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Seconds per rainfall bucket.
pub const BUCKET_SECS: i64 = 3_600;

/// Trailing window used for every rolling rainfall comparison.
pub const ROLLING_WINDOW_SECS: i64 = 24 * BUCKET_SECS;

/// Hour index of a unix timestamp (`floor(ts / 3600)`).
#[inline]
pub fn bucket_index(ts: i64) -> i64 {
    ts.div_euclid(BUCKET_SECS)
}

/// Start of the hour containing `ts`.
#[inline]
pub fn hour_floor(ts: i64) -> i64 {
    bucket_index(ts) * BUCKET_SECS
}

/// One hour of rainfall for a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RainBucket {
    pub bucket_index: i64,
    pub bucket_start: i64,
    pub rainfall_tenths_mm: u32,
}

/// Incrementally maintained 24h aggregate for one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindowState {
    pub last_bucket_index: i64,
    pub oldest_bucket_index: i64,
    pub rolling_sum_tenths_mm: u64,
}

impl RollingWindowState {
    /// `oldest > last` marks a window with nothing left in it.
    pub fn is_empty(&self) -> bool {
        self.oldest_bucket_index > self.last_bucket_index
    }
}

/// Monitor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Monitoring,
    Triggered,
    Matured,
    Reported,
}

impl MonitorState {
    pub const ALL: [MonitorState; 4] = [
        MonitorState::Monitoring,
        MonitorState::Triggered,
        MonitorState::Matured,
        MonitorState::Reported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Monitoring => "monitoring",
            MonitorState::Triggered => "triggered",
            MonitorState::Matured => "matured",
            MonitorState::Reported => "reported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitoring" => Some(MonitorState::Monitoring),
            "triggered" => Some(MonitorState::Triggered),
            "matured" => Some(MonitorState::Matured),
            "reported" => Some(MonitorState::Reported),
            _ => None,
        }
    }

    /// Triggered or matured: a report is owed to the ledger.
    pub fn awaiting_report(&self) -> bool {
        matches!(self, MonitorState::Triggered | MonitorState::Matured)
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Off-chain tracking record for one contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub location_id: String,
    pub contract_id: String,
    pub coverage_start: i64,
    pub coverage_end: i64,
    pub strike_tenths_mm: u32,
    pub state: MonitorState,
    pub cumulative_tenths_mm: u64,
    pub trigger_time: Option<i64>,
    pub last_fetch_at: Option<i64>,
    pub location_key: String,
    pub lat: f64,
    pub lon: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Monitor {
    pub fn monitor_id(location_id: &str, contract_id: &str) -> String {
        format!("{}:{}", location_id, contract_id)
    }

    /// Build a fresh monitor for a newly observed contract.
    pub fn from_created(event: &ContractCreated, now: i64) -> Self {
        Self {
            id: Self::monitor_id(&event.location_id, &event.contract_id),
            location_id: event.location_id.clone(),
            contract_id: event.contract_id.clone(),
            coverage_start: event.coverage_start,
            coverage_end: event.coverage_end,
            strike_tenths_mm: event.strike_tenths_mm,
            state: MonitorState::Monitoring,
            cumulative_tenths_mm: 0,
            trigger_time: None,
            last_fetch_at: None,
            location_key: location_key(event.lat, event.lon),
            lat: event.lat,
            lon: event.lon,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stable key for a coordinate pair, shared by monitors and ingest records.
pub fn location_key(lat: f64, lon: f64) -> String {
    format!("{:.4},{:.4}", lat, lon)
}

/// Hourly rainfall scoped to one monitor's coverage window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorBucket {
    pub monitor_id: String,
    pub hour_start: i64,
    pub rainfall_tenths_mm: u32,
    /// Zero-filled placeholder rather than upstream data.
    pub backfilled: bool,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAuditEntry {
    pub monitor_id: String,
    pub at: i64,
    pub kind: String,
    pub detail: Value,
}

/// Raw observation pushed through the authenticated ingest path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub contract_id: String,
    pub epoch_time: i64,
    pub location_key: String,
    pub fields: Value,
    pub sample_hash: String,
    pub received_at: i64,
}

/// Periodic aggregate snapshot pushed through the authenticated ingest path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub contract_id: String,
    pub observed_until: i64,
    pub agg_state: Value,
    pub commitment: String,
    pub received_at: i64,
}

/// Result of an idempotent upsert keyed by a deterministic id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

// ===== Ledger events =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreated {
    pub contract_id: String,
    pub location_id: String,
    pub coverage_start: i64,
    pub coverage_end: i64,
    pub strike_tenths_mm: u32,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Triggered,
    Matured,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSettled {
    pub contract_id: String,
    pub outcome: SettlementOutcome,
    pub cumulative_tenths_mm: u64,
    pub evidence_hash: String,
}

/// Contract lifecycle events observed on the settlement ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    ContractCreated(ContractCreated),
    ContractSettled(ContractSettled),
}

/// Ledger identity used for restart detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub genesis_hash: String,
    pub height: u64,
}
