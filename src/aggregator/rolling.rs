//! Time-bucketed rolling rainfall aggregator.
//!
//! Buckets are sparse (one upstream poll per hour) and may be corrected after
//! the fact. A resubmission for an existing bucket overwrites it and only the
//! delta is applied to the rolling sum, so an update costs O(1) plus whatever
//! falls out of the window.

use crate::models::{bucket_index, RainBucket, RollingWindowState, BUCKET_SECS, ROLLING_WINDOW_SECS};
use crate::storage::{RainBucketStore, RainBucketTxn};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const MAX_PAST_DRIFT_SECS: i64 = 7 * 24 * 3_600;
pub const MAX_FUTURE_DRIFT_SECS: i64 = 2 * 3_600;
/// 1,000 mm in one hour.
pub const MAX_RAINFALL_TENTHS_MM: u32 = 10_000;

/// Why a sample was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    TooFarInPast { timestamp: i64, now: i64 },
    TooFarInFuture { timestamp: i64, now: i64 },
    RainfallTooLarge { rainfall_tenths_mm: u32 },
}

impl SampleRejection {
    pub fn code(&self) -> &'static str {
        match self {
            SampleRejection::TooFarInPast { .. } => "timestamp_too_old",
            SampleRejection::TooFarInFuture { .. } => "timestamp_in_future",
            SampleRejection::RainfallTooLarge { .. } => "rainfall_out_of_range",
        }
    }
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleRejection::TooFarInPast { timestamp, now } => write!(
                f,
                "timestamp {} is more than {}s before now ({})",
                timestamp, MAX_PAST_DRIFT_SECS, now
            ),
            SampleRejection::TooFarInFuture { timestamp, now } => write!(
                f,
                "timestamp {} is more than {}s after now ({})",
                timestamp, MAX_FUTURE_DRIFT_SECS, now
            ),
            SampleRejection::RainfallTooLarge { rainfall_tenths_mm } => write!(
                f,
                "rainfall {} exceeds maximum {} tenths of mm",
                rainfall_tenths_mm, MAX_RAINFALL_TENTHS_MM
            ),
        }
    }
}

impl std::error::Error for SampleRejection {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub bucket_index: i64,
    pub previous_tenths_mm: u32,
    pub delta_tenths_mm: i64,
    /// False when the bucket was already older than the window; such samples
    /// are accepted but not retained.
    pub in_window: bool,
    pub pruned_buckets: usize,
    pub rolling_sum_tenths_mm: u64,
}

/// Smallest bucket index whose start is `>= now - 24h`.
#[inline]
fn first_live_index(now: i64) -> i64 {
    let cutoff = now - ROLLING_WINDOW_SECS;
    bucket_index(cutoff + BUCKET_SECS - 1)
}

#[inline]
fn apply_delta(sum: u64, delta: i64) -> u64 {
    (sum as i64).saturating_add(delta).max(0) as u64
}

/// Overwrite one bucket, apply its delta and prune the window edge inside a
/// single location transaction. Returns `(previous, pruned, new_state)`.
fn apply_sample(
    txn: &mut dyn RainBucketTxn,
    sample: &RainBucket,
    in_window: bool,
    live_from: i64,
) -> Result<(u32, usize, RollingWindowState)> {
    let idx = sample.bucket_index;
    let previous = txn
        .rain_bucket(idx)?
        .map(|b| b.rainfall_tenths_mm)
        .unwrap_or(0);
    let delta = sample.rainfall_tenths_mm as i64 - previous as i64;

    let mut state = txn.rolling_state()?.unwrap_or(RollingWindowState {
        last_bucket_index: idx,
        oldest_bucket_index: idx + 1,
        rolling_sum_tenths_mm: 0,
    });

    if in_window {
        txn.put_rain_bucket(sample)?;
        state.rolling_sum_tenths_mm = apply_delta(state.rolling_sum_tenths_mm, delta);

        if state.is_empty() {
            state.oldest_bucket_index = idx;
            state.last_bucket_index = state.last_bucket_index.max(idx);
        } else if idx < state.oldest_bucket_index {
            state.oldest_bucket_index = idx;
        }
        if idx > state.last_bucket_index {
            state.last_bucket_index = idx;
        }
    }

    // Walk the oldest edge forward past everything that fell out of the window.
    let pruned = txn.take_rain_buckets_before(live_from)?;
    for bucket in &pruned {
        state.rolling_sum_tenths_mm =
            apply_delta(state.rolling_sum_tenths_mm, -(bucket.rainfall_tenths_mm as i64));
    }
    if state.oldest_bucket_index < live_from {
        state.oldest_bucket_index = live_from.min(state.last_bucket_index + 1);
    }
    if state.is_empty() {
        state.rolling_sum_tenths_mm = 0;
    }

    txn.put_rolling_state(&state)?;
    Ok((previous, pruned.len(), state))
}

pub struct TimeBucketAggregator<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for TimeBucketAggregator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: RainBucketStore + ?Sized> TimeBucketAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn validate(
        timestamp: i64,
        rainfall_tenths_mm: u32,
        now: i64,
    ) -> std::result::Result<(), SampleRejection> {
        if timestamp < now - MAX_PAST_DRIFT_SECS {
            return Err(SampleRejection::TooFarInPast { timestamp, now });
        }
        if timestamp > now + MAX_FUTURE_DRIFT_SECS {
            return Err(SampleRejection::TooFarInFuture { timestamp, now });
        }
        if rainfall_tenths_mm > MAX_RAINFALL_TENTHS_MM {
            return Err(SampleRejection::RainfallTooLarge { rainfall_tenths_mm });
        }
        Ok(())
    }

    /// Record (or correct) the rainfall for the hour containing `timestamp`.
    /// The bucket write and the rolling-state update commit together or not
    /// at all, so a redelivered sample always repairs a failed attempt.
    ///
    /// Rejections surface as a [`SampleRejection`] inside the returned error.
    pub fn submit_sample(
        &self,
        location_id: &str,
        timestamp: i64,
        rainfall_tenths_mm: u32,
        now: i64,
    ) -> Result<SubmitOutcome> {
        Self::validate(timestamp, rainfall_tenths_mm, now)?;

        let idx = bucket_index(timestamp);
        let live_from = first_live_index(now);
        let in_window = idx >= live_from;
        let sample = RainBucket {
            bucket_index: idx,
            bucket_start: idx * BUCKET_SECS,
            rainfall_tenths_mm,
        };

        let mut applied = None;
        self.store.update_location(location_id, &mut |txn| {
            applied = Some(apply_sample(txn, &sample, in_window, live_from)?);
            Ok(())
        })?;
        let (previous, pruned, state) =
            applied.ok_or_else(|| anyhow!("rain sample update for {} did not run", location_id))?;
        let delta = rainfall_tenths_mm as i64 - previous as i64;

        debug!(
            location_id,
            bucket_index = idx,
            previous,
            delta,
            in_window,
            pruned,
            rolling_sum = state.rolling_sum_tenths_mm,
            "Rain sample applied"
        );

        Ok(SubmitOutcome {
            bucket_index: idx,
            previous_tenths_mm: previous,
            delta_tenths_mm: delta,
            in_window,
            pruned_buckets: pruned,
            rolling_sum_tenths_mm: state.rolling_sum_tenths_mm,
        })
    }

    pub fn rolling_state(&self, location_id: &str) -> Result<Option<RollingWindowState>> {
        self.store.rolling_state(location_id)
    }

    /// Exact 24h total at `now`, computed from the stored buckets without
    /// touching the incremental state.
    pub fn window_total(&self, location_id: &str, now: i64) -> Result<u64> {
        let buckets = self
            .store
            .rain_buckets_between(location_id, first_live_index(now), i64::MAX)?;
        Ok(buckets.iter().map(|b| b.rainfall_tenths_mm as u64).sum())
    }

    pub fn buckets(&self, location_id: &str) -> Result<Vec<RainBucket>> {
        self.store.rain_buckets_between(location_id, i64::MIN, i64::MAX)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const H: i64 = 3_600;
    // Arbitrary hour-aligned origin well past the epoch.
    const T0: i64 = 1_700_000_000 / H * H;

    fn aggregator() -> TimeBucketAggregator<SqliteStore> {
        TimeBucketAggregator::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    /// Samples land mid-hour and "now" is the sample time, so the 24h window
    /// holds exactly the current hour and the 23 before it.
    fn submit_hour(agg: &TimeBucketAggregator<SqliteStore>, hour: i64, tenths: u32) -> SubmitOutcome {
        let ts = T0 + hour * H + H / 2;
        agg.submit_sample("loc", ts, tenths, ts).unwrap()
    }

    #[test]
    fn test_worked_example_rolling_sums() {
        let agg = aggregator();
        for hour in 0..24 {
            submit_hour(&agg, hour, 20);
        }
        assert_eq!(agg.rolling_state("loc").unwrap().unwrap().rolling_sum_tenths_mm, 480);

        let out = submit_hour(&agg, 24, 30);
        assert_eq!(out.pruned_buckets, 1);
        assert_eq!(out.rolling_sum_tenths_mm, 490);

        let out = submit_hour(&agg, 25, 15);
        assert_eq!(out.rolling_sum_tenths_mm, 485);

        let state = agg.rolling_state("loc").unwrap().unwrap();
        assert_eq!(state.oldest_bucket_index, bucket_index(T0) + 2);
        assert_eq!(state.last_bucket_index, bucket_index(T0) + 25);
    }

    #[test]
    fn test_correction_overwrites_instead_of_adding() {
        let agg = aggregator();
        submit_hour(&agg, 0, 50);
        let out = submit_hour(&agg, 0, 20);
        assert_eq!(out.previous_tenths_mm, 50);
        assert_eq!(out.delta_tenths_mm, -30);
        assert_eq!(out.rolling_sum_tenths_mm, 20);

        // Same value again is a no-op.
        let out = submit_hour(&agg, 0, 20);
        assert_eq!(out.delta_tenths_mm, 0);
        assert_eq!(out.rolling_sum_tenths_mm, 20);
    }

    #[test]
    fn test_rejects_drift_and_oversized_values() {
        let agg = aggregator();
        let now = T0;

        let err = agg
            .submit_sample("loc", now - MAX_PAST_DRIFT_SECS - 1, 1, now)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SampleRejection>(),
            Some(SampleRejection::TooFarInPast { .. })
        ));

        let err = agg
            .submit_sample("loc", now + MAX_FUTURE_DRIFT_SECS + 1, 1, now)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SampleRejection>(),
            Some(SampleRejection::TooFarInFuture { .. })
        ));

        let err = agg
            .submit_sample("loc", now, MAX_RAINFALL_TENTHS_MM + 1, now)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SampleRejection>(),
            Some(SampleRejection::RainfallTooLarge { .. })
        ));

        // Boundaries are inclusive.
        agg.submit_sample("loc", now + MAX_FUTURE_DRIFT_SECS, MAX_RAINFALL_TENTHS_MM, now)
            .unwrap();
        assert!(agg.rolling_state("loc").unwrap().is_some());
    }

    #[test]
    fn test_stale_sample_is_not_retained() {
        let agg = aggregator();
        let now = T0 + 100 * H;
        let out = agg.submit_sample("loc", now - 48 * H, 70, now).unwrap();
        assert!(!out.in_window);
        assert_eq!(out.rolling_sum_tenths_mm, 0);
        assert!(agg.buckets("loc").unwrap().is_empty());
    }

    #[test]
    fn test_late_sample_inside_window_extends_oldest() {
        let agg = aggregator();
        let now = T0 + 30 * H + 10;
        agg.submit_sample("loc", now, 10, now).unwrap();
        let out = agg.submit_sample("loc", now - 5 * H, 25, now).unwrap();
        assert!(out.in_window);
        assert_eq!(out.rolling_sum_tenths_mm, 35);
        let state = agg.rolling_state("loc").unwrap().unwrap();
        assert_eq!(state.oldest_bucket_index, bucket_index(now - 5 * H));
    }

    #[test]
    fn test_everything_pruned_after_long_gap() {
        let agg = aggregator();
        submit_hour(&agg, 0, 40);
        submit_hour(&agg, 1, 40);

        // A correction arriving long after the window moved on still prunes.
        let now = T0 + 72 * H;
        let out = agg.submit_sample("loc", T0 + 71 * H - 2 * H, 0, now).unwrap();
        assert_eq!(out.pruned_buckets, 2);
        assert_eq!(out.rolling_sum_tenths_mm, 0);
        assert_eq!(agg.window_total("loc", now).unwrap(), 0);
    }

    #[test]
    fn test_rolling_sum_matches_brute_force_under_random_corrections() {
        for seed in 0..8u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let agg = aggregator();
            let mut reference: BTreeMap<i64, u32> = BTreeMap::new();
            let mut now = T0;

            for _ in 0..400 {
                now += rng.gen_range(0..2 * H);
                // Mix of fresh hours, corrections of recent hours and stale ones.
                let offset = rng.gen_range(-36 * H..=MAX_FUTURE_DRIFT_SECS);
                let ts = now + offset;
                let value = if rng.gen_bool(0.2) { 0 } else { rng.gen_range(0..=300) };

                let out = agg.submit_sample("loc", ts, value, now).unwrap();
                if out.in_window {
                    reference.insert(bucket_index(ts), value);
                }

                let live_from = first_live_index(now);
                reference.retain(|idx, _| *idx >= live_from);
                let expected: u64 = reference.values().map(|v| *v as u64).sum();

                let state = agg.rolling_state("loc").unwrap().unwrap();
                assert_eq!(state.rolling_sum_tenths_mm, expected, "seed {seed}");
                assert_eq!(agg.window_total("loc", now).unwrap(), expected, "seed {seed}");

                // Nothing older than the window survives in storage.
                let stored = agg.buckets("loc").unwrap();
                assert!(stored.iter().all(|b| b.bucket_index >= live_from));
                assert_eq!(stored.len(), reference.len());
            }
        }
    }

    /// Sqlite store whose next rolling-state write can be made to fail.
    struct FlakyStateStore {
        inner: SqliteStore,
        fail_state_write: AtomicBool,
    }

    struct FlakyTxn<'a> {
        inner: &'a mut dyn RainBucketTxn,
        fail: &'a AtomicBool,
    }

    impl RainBucketTxn for FlakyTxn<'_> {
        fn rain_bucket(&mut self, bucket_index: i64) -> Result<Option<RainBucket>> {
            self.inner.rain_bucket(bucket_index)
        }
        fn put_rain_bucket(&mut self, bucket: &RainBucket) -> Result<()> {
            self.inner.put_rain_bucket(bucket)
        }
        fn take_rain_buckets_before(&mut self, bucket_index: i64) -> Result<Vec<RainBucket>> {
            self.inner.take_rain_buckets_before(bucket_index)
        }
        fn rolling_state(&mut self) -> Result<Option<RollingWindowState>> {
            self.inner.rolling_state()
        }
        fn put_rolling_state(&mut self, state: &RollingWindowState) -> Result<()> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(anyhow!("disk I/O error"));
            }
            self.inner.put_rolling_state(state)
        }
    }

    impl RainBucketStore for FlakyStateStore {
        fn update_location(
            &self,
            location_id: &str,
            update: &mut dyn FnMut(&mut dyn RainBucketTxn) -> Result<()>,
        ) -> Result<()> {
            self.inner.update_location(location_id, &mut |txn| {
                update(&mut FlakyTxn {
                    inner: txn,
                    fail: &self.fail_state_write,
                })
            })
        }
        fn rain_buckets_between(&self, location_id: &str, from: i64, to: i64) -> Result<Vec<RainBucket>> {
            self.inner.rain_buckets_between(location_id, from, to)
        }
        fn rolling_state(&self, location_id: &str) -> Result<Option<RollingWindowState>> {
            self.inner.rolling_state(location_id)
        }
    }

    #[test]
    fn test_failed_state_write_is_repaired_by_redelivery() {
        let store = Arc::new(FlakyStateStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            fail_state_write: AtomicBool::new(false),
        });
        let agg = TimeBucketAggregator::new(store.clone());
        let first = T0 + H / 2;
        let second = first + H;
        agg.submit_sample("loc", first, 10, first).unwrap();

        store.fail_state_write.store(true, Ordering::SeqCst);
        assert!(agg.submit_sample("loc", second, 40, second).is_err());
        // Neither the bucket nor the sum moved.
        assert_eq!(agg.buckets("loc").unwrap().len(), 1);
        assert_eq!(agg.rolling_state("loc").unwrap().unwrap().rolling_sum_tenths_mm, 10);

        let out = agg.submit_sample("loc", second, 40, second).unwrap();
        assert_eq!(out.delta_tenths_mm, 40);
        assert_eq!(out.rolling_sum_tenths_mm, 50);
        assert_eq!(agg.window_total("loc", second).unwrap(), 50);
    }
}
