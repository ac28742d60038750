//! Rainfall aggregation
//!
//! - `rolling`: incremental 24h rolling sum over sparse, correctable hourly buckets
//! - `coverage`: threshold-crossing search over a coverage interval

pub mod coverage;
pub mod rolling;

pub use coverage::{
    first_crossing, validate_window, CoverageError, CoverageWindowEvaluator, Crossing,
    HourlyRainfall, LocationRainfall, MonitorRainfall,
};
pub use rolling::{SampleRejection, SubmitOutcome, TimeBucketAggregator};
