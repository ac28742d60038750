//! Rainwatch Backend Library
//!
//! Parametric rainfall cover monitoring: hourly rainfall aggregation,
//! coverage window evaluation, the monitor lifecycle and its settlement
//! reports, authenticated ingest and the REST surface over all of it.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod health;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod monitor;
pub mod scheduler;
pub mod storage;
pub mod upstream;
