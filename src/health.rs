//! Per-subsystem liveness bookkeeping for the health endpoints.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Database,
    Ledger,
    Weather,
    Scheduler,
    Ingest,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Database,
        Subsystem::Ledger,
        Subsystem::Weather,
        Subsystem::Scheduler,
        Subsystem::Ingest,
    ];
}

#[derive(Debug, Clone, Default)]
struct Entry {
    last_success: Option<i64>,
    last_failure: Option<i64>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsystemStatus {
    pub subsystem: Subsystem,
    pub online: bool,
    pub last_success_at: Option<i64>,
    pub seconds_since_success: Option<i64>,
    pub last_failure_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct HealthTracker {
    entries: RwLock<HashMap<Subsystem, Entry>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, subsystem: Subsystem, now: i64) {
        let mut entries = self.entries.write();
        let entry = entries.entry(subsystem).or_default();
        entry.last_success = Some(now);
    }

    pub fn record_failure(&self, subsystem: Subsystem, now: i64, error: impl ToString) {
        let mut entries = self.entries.write();
        let entry = entries.entry(subsystem).or_default();
        entry.last_failure = Some(now);
        entry.last_error = Some(error.to_string());
    }

    pub fn last_success(&self, subsystem: Subsystem) -> Option<i64> {
        self.entries.read().get(&subsystem).and_then(|e| e.last_success)
    }

    /// A subsystem is online when its latest recorded outcome was a success.
    /// Subsystems that never reported are listed as offline.
    pub fn status(&self, subsystem: Subsystem, now: i64) -> SubsystemStatus {
        let entries = self.entries.read();
        let entry = entries.get(&subsystem).cloned().unwrap_or_default();
        let online = match (entry.last_success, entry.last_failure) {
            (Some(ok), Some(bad)) => ok >= bad,
            (Some(_), None) => true,
            _ => false,
        };
        SubsystemStatus {
            subsystem,
            online,
            last_success_at: entry.last_success,
            seconds_since_success: entry.last_success.map(|t| (now - t).max(0)),
            last_failure_at: entry.last_failure,
            last_error: if online { None } else { entry.last_error },
        }
    }

    pub fn snapshot(&self, now: i64) -> Vec<SubsystemStatus> {
        Subsystem::ALL.iter().map(|s| self.status(*s, now)).collect()
    }
}
