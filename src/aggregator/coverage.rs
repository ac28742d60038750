//! Coverage window evaluation: did the trailing 24h rainfall meet the strike
//! at any hour of a contract's coverage interval?

use crate::models::{bucket_index, hour_floor, BUCKET_SECS, ROLLING_WINDOW_SECS};
use crate::storage::{MonitorStore, RainBucketStore};
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Longest coverage interval accepted (169 hourly steps).
pub const MAX_COVERAGE_SECS: i64 = 7 * 24 * 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageError {
    EmptyWindow { start: i64, end: i64 },
    WindowTooLong { start: i64, end: i64 },
}

impl fmt::Display for CoverageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageError::EmptyWindow { start, end } => {
                write!(f, "coverage start {} must be before end {}", start, end)
            }
            CoverageError::WindowTooLong { start, end } => write!(
                f,
                "coverage window {}..{} exceeds {}s",
                start, end, MAX_COVERAGE_SECS
            ),
        }
    }
}

impl std::error::Error for CoverageError {}

/// Where hourly totals come from.
pub trait HourlyRainfall {
    /// `(hour_start, tenths_mm)` for hours starting in `[from, to]`, ascending.
    fn hourly_between(&self, from: i64, to: i64) -> Result<Vec<(i64, u32)>>;
}

/// The global per-location bucket table.
pub struct LocationRainfall<'a, S: ?Sized> {
    pub store: &'a S,
    pub location_id: &'a str,
}

impl<S: RainBucketStore + ?Sized> HourlyRainfall for LocationRainfall<'_, S> {
    fn hourly_between(&self, from: i64, to: i64) -> Result<Vec<(i64, u32)>> {
        let buckets = self.store.rain_buckets_between(
            self.location_id,
            bucket_index(from + BUCKET_SECS - 1),
            bucket_index(to),
        )?;
        Ok(buckets
            .into_iter()
            .map(|b| (b.bucket_start, b.rainfall_tenths_mm))
            .collect())
    }
}

/// One monitor's own hourly buckets.
pub struct MonitorRainfall<'a, S: ?Sized> {
    pub store: &'a S,
    pub monitor_id: &'a str,
}

impl<S: MonitorStore + ?Sized> HourlyRainfall for MonitorRainfall<'_, S> {
    fn hourly_between(&self, from: i64, to: i64) -> Result<Vec<(i64, u32)>> {
        let buckets = self
            .store
            .monitor_buckets(self.monitor_id, from, to.saturating_add(1))?;
        Ok(buckets
            .into_iter()
            .map(|b| (b.hour_start, b.rainfall_tenths_mm))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Crossing {
    /// Evaluation instant at which the trailing sum first met the strike.
    pub at: i64,
    pub rolling_sum_tenths_mm: u64,
}

/// Reject empty or over-long coverage intervals.
pub fn validate_window(start: i64, end: i64) -> std::result::Result<(), CoverageError> {
    if start >= end {
        return Err(CoverageError::EmptyWindow { start, end });
    }
    if end - start > MAX_COVERAGE_SECS {
        return Err(CoverageError::WindowTooLong { start, end });
    }
    Ok(())
}

/// Step hourly from `start` to `end` (inclusive) and return the first instant
/// whose trailing 24h sum (buckets starting in `[t - 24h, t]`) is `>= strike`.
pub fn first_crossing<R: HourlyRainfall + ?Sized>(
    source: &R,
    strike_tenths_mm: u32,
    start: i64,
    end: i64,
) -> Result<Option<Crossing>> {
    validate_window(start, end)?;

    let hours = source.hourly_between(hour_floor(start - ROLLING_WINDOW_SECS), end)?;

    let mut t = start;
    loop {
        let lower = t - ROLLING_WINDOW_SECS;
        let sum: u64 = hours
            .iter()
            .filter(|(hour_start, _)| *hour_start >= lower && *hour_start <= t)
            .map(|(_, tenths)| *tenths as u64)
            .sum();

        if sum >= strike_tenths_mm as u64 {
            return Ok(Some(Crossing {
                at: t,
                rolling_sum_tenths_mm: sum,
            }));
        }

        if t >= end {
            return Ok(None);
        }
        t = (t + BUCKET_SECS).min(end);
    }
}

/// Answers threshold questions against the global location buckets.
pub struct CoverageWindowEvaluator<S: ?Sized> {
    store: Arc<S>,
}

impl<S: RainBucketStore + ?Sized> CoverageWindowEvaluator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn was_threshold_crossed(
        &self,
        location_id: &str,
        strike_tenths_mm: u32,
        coverage_start: i64,
        coverage_end: i64,
    ) -> Result<bool> {
        Ok(self
            .first_crossing(location_id, strike_tenths_mm, coverage_start, coverage_end)?
            .is_some())
    }

    pub fn first_crossing(
        &self,
        location_id: &str,
        strike_tenths_mm: u32,
        coverage_start: i64,
        coverage_end: i64,
    ) -> Result<Option<Crossing>> {
        let source = LocationRainfall {
            store: self.store.as_ref(),
            location_id,
        };
        first_crossing(&source, strike_tenths_mm, coverage_start, coverage_end)
    }
}
