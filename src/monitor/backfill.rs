//! Gap reconstruction for a monitor's hourly buckets.
//!
//! Hours still inside the provider's 24h lookback are filled with real data;
//! older hours can never be recovered and are zero-filled as a conservative
//! placeholder (`backfilled = true`).

use crate::models::{hour_floor, BUCKET_SECS, ROLLING_WINDOW_SECS};
use crate::upstream::HourlyReading;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Real(u32),
    Zero,
    /// Inside the lookback but absent from the feed; retried on the next run.
    Unavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub monitor_id: String,
    pub range_start: i64,
    pub range_end: i64,
    pub missing_hours: usize,
    pub filled_real: usize,
    pub filled_zero: usize,
    pub still_missing: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_fetch_error: Option<String>,
}

/// Hours the backfill is responsible for: starts in
/// `[floor_hour(coverage_start), min(coverage_end, now))`.
pub fn backfill_range(coverage_start: i64, coverage_end: i64, now: i64) -> (i64, i64) {
    (hour_floor(coverage_start), coverage_end.min(now))
}

pub fn missing_hours(existing: &BTreeSet<i64>, range_start: i64, range_end: i64) -> Vec<i64> {
    let mut missing = Vec::new();
    let mut hour = range_start;
    while hour < range_end {
        if !existing.contains(&hour) {
            missing.push(hour);
        }
        hour += BUCKET_SECS;
    }
    missing
}

/// Decide how each missing hour gets filled. `feed` is `None` when the
/// provider could not be reached.
pub fn plan_fills(
    missing: &[i64],
    feed: Option<&[HourlyReading]>,
    now: i64,
) -> Vec<(i64, Fill)> {
    let by_hour: HashMap<i64, u32> = feed
        .unwrap_or_default()
        .iter()
        .map(|r| (r.hour_start, r.rainfall_tenths_mm))
        .collect();
    let lookback_start = now - ROLLING_WINDOW_SECS;

    missing
        .iter()
        .map(|&hour| {
            let fill = match by_hour.get(&hour) {
                Some(tenths) => Fill::Real(*tenths),
                None if hour < lookback_start => Fill::Zero,
                None => Fill::Unavailable,
            };
            (hour, fill)
        })
        .collect()
}
