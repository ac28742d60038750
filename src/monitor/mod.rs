//! Policy monitors
//!
//! - `state`: legal lifecycle transitions
//! - `engine`: evaluation, reporting, settlement handling and admin reset
//! - `backfill`: gap planning for a monitor's hourly buckets
//! - `report`: signed settlement reports

pub mod backfill;
pub mod engine;
pub mod report;
pub mod state;

pub use backfill::BackfillReport;
pub use engine::{CycleSummary, EvaluationOutcome, MonitorEngine, MonitorNotFound, ReportOutcome};
pub use report::{build_report, evidence_hash, ReportSigner, SettlementReport};
pub use state::{next_state, Transition, TransitionError};
