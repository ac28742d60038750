//! Persistence interfaces
//!
//! Every mutation is an idempotent upsert keyed by a deterministic id, so
//! replayed ledger events and repeated ingest batches are safe without locking.
//! `SqliteStore` implements all of the traits; components hold only the slice
//! they need.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::models::{
    ChainInfo, Monitor, MonitorAuditEntry, MonitorBucket, MonitorState, ObservationRecord,
    RainBucket, RollingWindowState, SnapshotRecord, UpsertOutcome,
};
use anyhow::Result;
use serde::Serialize;

/// Bucket and rolling-state access for one location, scoped to a single
/// transaction opened by [`RainBucketStore::update_location`].
pub trait RainBucketTxn {
    fn rain_bucket(&mut self, bucket_index: i64) -> Result<Option<RainBucket>>;
    fn put_rain_bucket(&mut self, bucket: &RainBucket) -> Result<()>;
    /// Delete and return every bucket with index strictly below `bucket_index`.
    fn take_rain_buckets_before(&mut self, bucket_index: i64) -> Result<Vec<RainBucket>>;
    fn rolling_state(&mut self) -> Result<Option<RollingWindowState>>;
    fn put_rolling_state(&mut self, state: &RollingWindowState) -> Result<()>;
}

/// Global per-location hourly buckets plus the rolling state derived from them.
pub trait RainBucketStore: Send + Sync {
    /// Run `update` atomically. Everything it wrote is committed when it
    /// returns `Ok` and rolled back otherwise. Writers for the same store are
    /// serialized for the duration.
    fn update_location(
        &self,
        location_id: &str,
        update: &mut dyn FnMut(&mut dyn RainBucketTxn) -> Result<()>,
    ) -> Result<()>;
    /// Buckets with index in `[from_index, to_index]`, ascending.
    fn rain_buckets_between(
        &self,
        location_id: &str,
        from_index: i64,
        to_index: i64,
    ) -> Result<Vec<RainBucket>>;
    fn rolling_state(&self, location_id: &str) -> Result<Option<RollingWindowState>>;
}

pub trait MonitorStore: Send + Sync {
    fn monitor(&self, id: &str) -> Result<Option<Monitor>>;
    fn insert_monitor_if_absent(&self, monitor: &Monitor) -> Result<UpsertOutcome>;
    fn save_monitor(&self, monitor: &Monitor) -> Result<()>;
    fn monitors(&self, state: Option<MonitorState>) -> Result<Vec<Monitor>>;
    fn monitors_for_contract(&self, contract_id: &str) -> Result<Vec<Monitor>>;
    fn count_by_state(&self) -> Result<Vec<(MonitorState, u64)>>;

    /// Placeholder (`backfilled`) rows never overwrite real upstream data.
    fn upsert_monitor_bucket(&self, bucket: &MonitorBucket) -> Result<()>;
    /// Buckets with `hour_start` in `[from, to)`, ascending.
    fn monitor_buckets(&self, monitor_id: &str, from: i64, to: i64) -> Result<Vec<MonitorBucket>>;

    fn append_audit(&self, entry: &MonitorAuditEntry) -> Result<()>;
    fn audit_trail(&self, monitor_id: &str) -> Result<Vec<MonitorAuditEntry>>;
}

pub trait IngestStore: Send + Sync {
    fn upsert_observation(&self, record: &ObservationRecord) -> Result<UpsertOutcome>;
    fn upsert_snapshot(&self, record: &SnapshotRecord) -> Result<UpsertOutcome>;
    /// Returns `(observations_deleted, snapshots_deleted)`.
    fn prune_ingest(&self, observations_before: i64, snapshots_before: i64)
        -> Result<(usize, usize)>;
    /// Returns `(observations, snapshots)` received at or after `since`.
    fn ingest_counts_since(&self, since: i64) -> Result<(u64, u64)>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearedCounts {
    pub monitors: usize,
    pub monitor_buckets: usize,
    pub rain_buckets: usize,
    pub audit_entries: usize,
}

/// Ledger identity bookkeeping and whole-database maintenance.
pub trait ChainMetaStore: Send + Sync {
    fn chain_meta(&self) -> Result<Option<ChainInfo>>;
    fn put_chain_meta(&self, info: &ChainInfo) -> Result<()>;
    /// Next ledger height whose events have not been applied yet.
    fn event_cursor(&self) -> Result<Option<u64>>;
    fn put_event_cursor(&self, next_height: u64) -> Result<()>;
    /// Drop monitors, all bucket tables, rolling state, audit records and the
    /// event cursor.
    fn clear_monitoring_data(&self) -> Result<ClearedCounts>;
    fn ping(&self) -> Result<()>;
}
