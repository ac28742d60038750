//! SQLite-backed store
//!
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - `INSERT OR IGNORE` / `ON CONFLICT` upserts keyed by deterministic ids

use super::{
    ChainMetaStore, ClearedCounts, IngestStore, MonitorStore, RainBucketStore, RainBucketTxn,
};
use crate::models::{
    ChainInfo, Monitor, MonitorAuditEntry, MonitorBucket, MonitorState, ObservationRecord,
    RainBucket, RollingWindowState, SnapshotRecord, UpsertOutcome,
};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS rain_buckets (
    location_id TEXT NOT NULL,
    bucket_index INTEGER NOT NULL,
    bucket_start INTEGER NOT NULL,
    rainfall_tenths_mm INTEGER NOT NULL,
    PRIMARY KEY (location_id, bucket_index)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS rolling_state (
    location_id TEXT PRIMARY KEY,
    last_bucket_index INTEGER NOT NULL,
    oldest_bucket_index INTEGER NOT NULL,
    rolling_sum_tenths_mm INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS monitors (
    id TEXT PRIMARY KEY,
    location_id TEXT NOT NULL,
    contract_id TEXT NOT NULL,
    coverage_start INTEGER NOT NULL,
    coverage_end INTEGER NOT NULL,
    strike_tenths_mm INTEGER NOT NULL,
    state TEXT NOT NULL,
    cumulative_tenths_mm INTEGER NOT NULL,
    trigger_time INTEGER,
    last_fetch_at INTEGER,
    location_key TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_monitors_state ON monitors(state, coverage_end);
CREATE INDEX IF NOT EXISTS idx_monitors_contract ON monitors(contract_id);

CREATE TABLE IF NOT EXISTS monitor_buckets (
    monitor_id TEXT NOT NULL,
    hour_start INTEGER NOT NULL,
    rainfall_tenths_mm INTEGER NOT NULL,
    backfilled INTEGER NOT NULL,
    fetched_at INTEGER NOT NULL,
    PRIMARY KEY (monitor_id, hour_start)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS monitor_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    monitor_id TEXT NOT NULL,
    at INTEGER NOT NULL,
    kind TEXT NOT NULL,
    detail_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_monitor_audit_monitor ON monitor_audit(monitor_id, id);

CREATE TABLE IF NOT EXISTS observations (
    contract_id TEXT NOT NULL,
    epoch_time INTEGER NOT NULL,
    location_key TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    sample_hash TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    PRIMARY KEY (contract_id, epoch_time)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_observations_received ON observations(received_at);

CREATE TABLE IF NOT EXISTS snapshots (
    contract_id TEXT NOT NULL,
    observed_until INTEGER NOT NULL,
    agg_state_json TEXT NOT NULL,
    commitment TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    PRIMARY KEY (contract_id, observed_until)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snapshots_received ON snapshots(received_at);

CREATE TABLE IF NOT EXISTS chain_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

const MONITOR_COLUMNS: &str = "id, location_id, contract_id, coverage_start, coverage_end, \
     strike_tenths_mm, state, cumulative_tenths_mm, trigger_time, last_fetch_at, \
     location_key, lat, lon, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let store = Self::init(conn)?;

        info!(path = %path.display(), "Monitor database initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !matches!(journal_mode.to_lowercase().as_str(), "wal" | "memory") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn monitor_from_row(row: &Row<'_>) -> rusqlite::Result<Monitor> {
    let state: String = row.get(6)?;
    let state = MonitorState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown monitor state {state:?}").into(),
        )
    })?;
    Ok(Monitor {
        id: row.get(0)?,
        location_id: row.get(1)?,
        contract_id: row.get(2)?,
        coverage_start: row.get(3)?,
        coverage_end: row.get(4)?,
        strike_tenths_mm: row.get(5)?,
        state,
        cumulative_tenths_mm: row.get::<_, i64>(7)?.max(0) as u64,
        trigger_time: row.get(8)?,
        last_fetch_at: row.get(9)?,
        location_key: row.get(10)?,
        lat: row.get(11)?,
        lon: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn rain_bucket_from_row(row: &Row<'_>) -> rusqlite::Result<RainBucket> {
    Ok(RainBucket {
        bucket_index: row.get(0)?,
        bucket_start: row.get(1)?,
        rainfall_tenths_mm: row.get(2)?,
    })
}

fn upsert_outcome(changes: usize) -> UpsertOutcome {
    if changes > 0 {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::AlreadyPresent
    }
}

fn select_rain_bucket(
    conn: &Connection,
    location_id: &str,
    bucket_index: i64,
) -> Result<Option<RainBucket>> {
    let mut stmt = conn.prepare_cached(
        "SELECT bucket_index, bucket_start, rainfall_tenths_mm
         FROM rain_buckets WHERE location_id = ?1 AND bucket_index = ?2",
    )?;
    Ok(stmt
        .query_row(params![location_id, bucket_index], rain_bucket_from_row)
        .optional()?)
}

fn select_rolling_state(conn: &Connection, location_id: &str) -> Result<Option<RollingWindowState>> {
    let mut stmt = conn.prepare_cached(
        "SELECT last_bucket_index, oldest_bucket_index, rolling_sum_tenths_mm
         FROM rolling_state WHERE location_id = ?1",
    )?;
    let state = stmt
        .query_row(params![location_id], |row| {
            Ok(RollingWindowState {
                last_bucket_index: row.get(0)?,
                oldest_bucket_index: row.get(1)?,
                rolling_sum_tenths_mm: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })
        .optional()?;
    Ok(state)
}

/// Location-scoped view over an open transaction.
struct SqliteBucketTxn<'t> {
    conn: &'t Connection,
    location_id: &'t str,
}

impl RainBucketTxn for SqliteBucketTxn<'_> {
    fn rain_bucket(&mut self, bucket_index: i64) -> Result<Option<RainBucket>> {
        select_rain_bucket(self.conn, self.location_id, bucket_index)
    }

    fn put_rain_bucket(&mut self, bucket: &RainBucket) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO rain_buckets (location_id, bucket_index, bucket_start, rainfall_tenths_mm)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(location_id, bucket_index) DO UPDATE SET
                    bucket_start = excluded.bucket_start,
                    rainfall_tenths_mm = excluded.rainfall_tenths_mm",
            )?
            .execute(params![
                self.location_id,
                bucket.bucket_index,
                bucket.bucket_start,
                bucket.rainfall_tenths_mm
            ])?;
        Ok(())
    }

    fn take_rain_buckets_before(&mut self, bucket_index: i64) -> Result<Vec<RainBucket>> {
        let taken = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT bucket_index, bucket_start, rainfall_tenths_mm
                 FROM rain_buckets WHERE location_id = ?1 AND bucket_index < ?2
                 ORDER BY bucket_index ASC",
            )?;
            let rows =
                stmt.query_map(params![self.location_id, bucket_index], rain_bucket_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        self.conn.execute(
            "DELETE FROM rain_buckets WHERE location_id = ?1 AND bucket_index < ?2",
            params![self.location_id, bucket_index],
        )?;
        Ok(taken)
    }

    fn rolling_state(&mut self) -> Result<Option<RollingWindowState>> {
        select_rolling_state(self.conn, self.location_id)
    }

    fn put_rolling_state(&mut self, state: &RollingWindowState) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO rolling_state
                    (location_id, last_bucket_index, oldest_bucket_index, rolling_sum_tenths_mm)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(location_id) DO UPDATE SET
                    last_bucket_index = excluded.last_bucket_index,
                    oldest_bucket_index = excluded.oldest_bucket_index,
                    rolling_sum_tenths_mm = excluded.rolling_sum_tenths_mm",
            )?
            .execute(params![
                self.location_id,
                state.last_bucket_index,
                state.oldest_bucket_index,
                state.rolling_sum_tenths_mm as i64
            ])?;
        Ok(())
    }
}

impl RainBucketStore for SqliteStore {
    fn update_location(
        &self,
        location_id: &str,
        update: &mut dyn FnMut(&mut dyn RainBucketTxn) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // Dropping `tx` on the error path rolls back.
        update(&mut SqliteBucketTxn {
            conn: &tx,
            location_id,
        })?;
        tx.commit()?;
        Ok(())
    }

    fn rain_buckets_between(
        &self,
        location_id: &str,
        from_index: i64,
        to_index: i64,
    ) -> Result<Vec<RainBucket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bucket_index, bucket_start, rainfall_tenths_mm
             FROM rain_buckets
             WHERE location_id = ?1 AND bucket_index >= ?2 AND bucket_index <= ?3
             ORDER BY bucket_index ASC",
        )?;
        let rows = stmt.query_map(params![location_id, from_index, to_index], rain_bucket_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn rolling_state(&self, location_id: &str) -> Result<Option<RollingWindowState>> {
        let conn = self.conn.lock();
        select_rolling_state(&conn, location_id)
    }
}

impl MonitorStore for SqliteStore {
    fn monitor(&self, id: &str) -> Result<Option<Monitor>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![id], monitor_from_row).optional()?)
    }

    fn insert_monitor_if_absent(&self, m: &Monitor) -> Result<UpsertOutcome> {
        let conn = self.conn.lock();
        let sql = format!(
            "INSERT OR IGNORE INTO monitors ({MONITOR_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        let changes = conn.prepare_cached(&sql)?.execute(params![
            m.id,
            m.location_id,
            m.contract_id,
            m.coverage_start,
            m.coverage_end,
            m.strike_tenths_mm,
            m.state.as_str(),
            m.cumulative_tenths_mm as i64,
            m.trigger_time,
            m.last_fetch_at,
            m.location_key,
            m.lat,
            m.lon,
            m.created_at,
            m.updated_at,
        ])?;
        Ok(upsert_outcome(changes))
    }

    fn save_monitor(&self, m: &Monitor) -> Result<()> {
        let conn = self.conn.lock();
        let changes = conn
            .prepare_cached(
                "UPDATE monitors SET
                    state = ?2, cumulative_tenths_mm = ?3, trigger_time = ?4,
                    last_fetch_at = ?5, updated_at = ?6
                 WHERE id = ?1",
            )?
            .execute(params![
                m.id,
                m.state.as_str(),
                m.cumulative_tenths_mm as i64,
                m.trigger_time,
                m.last_fetch_at,
                m.updated_at,
            ])?;
        if changes == 0 {
            return Err(anyhow!("monitor {} not found", m.id));
        }
        Ok(())
    }

    fn monitors(&self, state: Option<MonitorState>) -> Result<Vec<Monitor>> {
        let conn = self.conn.lock();
        let monitors = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {MONITOR_COLUMNS} FROM monitors WHERE state = ?1 ORDER BY created_at, id"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map(params![state.as_str()], monitor_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors ORDER BY created_at, id");
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map([], monitor_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(monitors)
    }

    fn monitors_for_contract(&self, contract_id: &str) -> Result<Vec<Monitor>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE contract_id = ?1 ORDER BY id");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![contract_id], monitor_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn count_by_state(&self) -> Result<Vec<(MonitorState, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT state, COUNT(*) FROM monitors GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts: Vec<(MonitorState, u64)> =
            MonitorState::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let (state, count) = row?;
            match MonitorState::parse(&state) {
                Some(state) => {
                    if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == state) {
                        slot.1 = count.max(0) as u64;
                    }
                }
                None => warn!(state = %state, "Unknown monitor state in database"),
            }
        }
        Ok(counts)
    }

    fn upsert_monitor_bucket(&self, b: &MonitorBucket) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO monitor_buckets
                (monitor_id, hour_start, rainfall_tenths_mm, backfilled, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(monitor_id, hour_start) DO UPDATE SET
                rainfall_tenths_mm = excluded.rainfall_tenths_mm,
                backfilled = excluded.backfilled,
                fetched_at = excluded.fetched_at
             WHERE excluded.backfilled = 0 OR monitor_buckets.backfilled = 1",
        )?
        .execute(params![
            b.monitor_id,
            b.hour_start,
            b.rainfall_tenths_mm,
            b.backfilled,
            b.fetched_at
        ])?;
        Ok(())
    }

    fn monitor_buckets(&self, monitor_id: &str, from: i64, to: i64) -> Result<Vec<MonitorBucket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT monitor_id, hour_start, rainfall_tenths_mm, backfilled, fetched_at
             FROM monitor_buckets
             WHERE monitor_id = ?1 AND hour_start >= ?2 AND hour_start < ?3
             ORDER BY hour_start ASC",
        )?;
        let rows = stmt.query_map(params![monitor_id, from, to], |row| {
            Ok(MonitorBucket {
                monitor_id: row.get(0)?,
                hour_start: row.get(1)?,
                rainfall_tenths_mm: row.get(2)?,
                backfilled: row.get(3)?,
                fetched_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_audit(&self, entry: &MonitorAuditEntry) -> Result<()> {
        let detail_json = serde_json::to_string(&entry.detail)?;
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO monitor_audit (monitor_id, at, kind, detail_json) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![entry.monitor_id, entry.at, entry.kind, detail_json])?;
        Ok(())
    }

    fn audit_trail(&self, monitor_id: &str) -> Result<Vec<MonitorAuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT monitor_id, at, kind, detail_json FROM monitor_audit
             WHERE monitor_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![monitor_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (monitor_id, at, kind, detail_json) = row?;
            out.push(MonitorAuditEntry {
                monitor_id,
                at,
                kind,
                detail: serde_json::from_str(&detail_json).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }
}

impl IngestStore for SqliteStore {
    fn upsert_observation(&self, r: &ObservationRecord) -> Result<UpsertOutcome> {
        let fields_json = serde_json::to_string(&r.fields)?;
        let conn = self.conn.lock();
        let changes = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO observations
                    (contract_id, epoch_time, location_key, fields_json, sample_hash, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                r.contract_id,
                r.epoch_time,
                r.location_key,
                fields_json,
                r.sample_hash,
                r.received_at
            ])?;
        Ok(upsert_outcome(changes))
    }

    fn upsert_snapshot(&self, r: &SnapshotRecord) -> Result<UpsertOutcome> {
        let agg_state_json = serde_json::to_string(&r.agg_state)?;
        let conn = self.conn.lock();
        let changes = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO snapshots
                    (contract_id, observed_until, agg_state_json, commitment, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                r.contract_id,
                r.observed_until,
                agg_state_json,
                r.commitment,
                r.received_at
            ])?;
        Ok(upsert_outcome(changes))
    }

    fn prune_ingest(&self, observations_before: i64, snapshots_before: i64) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let observations = conn.execute(
            "DELETE FROM observations WHERE received_at < ?1",
            params![observations_before],
        )?;
        let snapshots = conn.execute(
            "DELETE FROM snapshots WHERE received_at < ?1",
            params![snapshots_before],
        )?;
        Ok((observations, snapshots))
    }

    fn ingest_counts_since(&self, since: i64) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let observations: i64 = conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE received_at >= ?1",
            params![since],
            |row| row.get(0),
        )?;
        let snapshots: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE received_at >= ?1",
            params![since],
            |row| row.get(0),
        )?;
        Ok((observations.max(0) as u64, snapshots.max(0) as u64))
    }
}

impl ChainMetaStore for SqliteStore {
    fn chain_meta(&self) -> Result<Option<ChainInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM chain_meta WHERE key = ?1")?;
        let genesis: Option<String> = stmt
            .query_row(params!["genesis_hash"], |row| row.get(0))
            .optional()?;
        let height: Option<String> = stmt
            .query_row(params!["last_height"], |row| row.get(0))
            .optional()?;

        match (genesis, height) {
            (Some(genesis_hash), Some(height)) => Ok(Some(ChainInfo {
                genesis_hash,
                height: height
                    .parse()
                    .with_context(|| format!("corrupt last_height {height:?}"))?,
            })),
            _ => Ok(None),
        }
    }

    fn put_chain_meta(&self, info: &ChainInfo) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (key, value) in [
            ("genesis_hash", info.genesis_hash.clone()),
            ("last_height", info.height.to_string()),
        ] {
            tx.execute(
                "INSERT INTO chain_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn event_cursor(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .prepare_cached("SELECT value FROM chain_meta WHERE key = ?1")?
            .query_row(params!["event_cursor"], |row| row.get(0))
            .optional()?;
        value
            .map(|v| {
                v.parse()
                    .with_context(|| format!("corrupt event_cursor {v:?}"))
            })
            .transpose()
    }

    fn put_event_cursor(&self, next_height: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chain_meta (key, value) VALUES ('event_cursor', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![next_height.to_string()],
        )?;
        Ok(())
    }

    fn clear_monitoring_data(&self) -> Result<ClearedCounts> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let counts = ClearedCounts {
            monitors: tx.execute("DELETE FROM monitors", [])?,
            monitor_buckets: tx.execute("DELETE FROM monitor_buckets", [])?,
            rain_buckets: tx.execute("DELETE FROM rain_buckets", [])?,
            audit_entries: tx.execute("DELETE FROM monitor_audit", [])?,
        };
        tx.execute("DELETE FROM rolling_state", [])?;
        tx.execute("DELETE FROM chain_meta WHERE key = 'event_cursor'", [])?;
        tx.commit()?;
        Ok(counts)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
