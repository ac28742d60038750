//! Ledger restart detection
//!
//! A dev ledger that restarts comes back with a new genesis or a much lower
//! height; every monitor derived from the old chain is then meaningless.

use crate::models::ChainInfo;
use crate::storage::{ChainMetaStore, ClearedCounts};
use crate::upstream::SettlementLedger;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Height regressions up to this many blocks are treated as ordinary reorgs.
pub const HEIGHT_REGRESSION_TOLERANCE: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResetReason {
    GenesisChanged { previous: String, current: String },
    HeightRegressed { previous: u64, current: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RestartVerdict {
    FirstSeen,
    Continuous,
    Reset {
        reason: ResetReason,
        cleared: ClearedCounts,
    },
}

pub struct RestartGapDetector {
    store: Arc<dyn ChainMetaStore>,
    tolerance: u64,
}

impl RestartGapDetector {
    pub fn new(store: Arc<dyn ChainMetaStore>) -> Self {
        Self {
            store,
            tolerance: HEIGHT_REGRESSION_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: u64) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn reset_reason(&self, previous: &ChainInfo, current: &ChainInfo) -> Option<ResetReason> {
        if previous.genesis_hash != current.genesis_hash {
            return Some(ResetReason::GenesisChanged {
                previous: previous.genesis_hash.clone(),
                current: current.genesis_hash.clone(),
            });
        }
        if previous.height.saturating_sub(current.height) > self.tolerance {
            return Some(ResetReason::HeightRegressed {
                previous: previous.height,
                current: current.height,
            });
        }
        None
    }

    /// Compare `current` with the recorded identity, clearing monitoring data
    /// on a restart, then record the new identity.
    pub fn check(&self, current: &ChainInfo) -> Result<RestartVerdict> {
        let Some(previous) = self.store.chain_meta()? else {
            self.store.put_chain_meta(current)?;
            info!(
                genesis = %current.genesis_hash,
                height = current.height,
                "Ledger identity recorded"
            );
            return Ok(RestartVerdict::FirstSeen);
        };

        match self.reset_reason(&previous, current) {
            Some(reason) => {
                warn!(?reason, "Ledger restart detected, clearing monitoring data");
                let cleared = self
                    .store
                    .clear_monitoring_data()
                    .context("clear monitoring data after ledger restart")?;
                self.store.put_chain_meta(current)?;
                warn!(
                    monitors = cleared.monitors,
                    monitor_buckets = cleared.monitor_buckets,
                    rain_buckets = cleared.rain_buckets,
                    "Monitoring data cleared"
                );
                Ok(RestartVerdict::Reset { reason, cleared })
            }
            None => {
                // Keep the high-water mark so small regressions cannot accumulate.
                let height = previous.height.max(current.height);
                self.store.put_chain_meta(&ChainInfo {
                    genesis_hash: current.genesis_hash.clone(),
                    height,
                })?;
                Ok(RestartVerdict::Continuous)
            }
        }
    }

    pub async fn check_ledger(&self, ledger: &dyn SettlementLedger) -> Result<RestartVerdict> {
        let current = ledger.chain_info().await.context("fetch ledger chain info")?;
        self.check(&current)
    }

    /// Advance the recorded height as events are consumed.
    pub fn record_height(&self, height: u64) -> Result<()> {
        if let Some(mut meta) = self.store.chain_meta()? {
            if height > meta.height {
                meta.height = height;
                self.store.put_chain_meta(&meta)?;
            }
        }
        Ok(())
    }

    pub fn last_height(&self) -> Result<Option<u64>> {
        Ok(self.store.chain_meta()?.map(|m| m.height))
    }

    /// Height to poll events from after a connect with `verdict`. Only a
    /// continuous chain resumes from the saved cursor; a new or reset chain
    /// is read from the start.
    pub fn resume_height(&self, verdict: &RestartVerdict) -> Result<u64> {
        match verdict {
            RestartVerdict::Continuous => Ok(self.store.event_cursor()?.unwrap_or(0)),
            RestartVerdict::FirstSeen | RestartVerdict::Reset { .. } => Ok(0),
        }
    }

    /// Persist the next height to poll once a page of events is applied.
    pub fn save_cursor(&self, next_height: u64) -> Result<()> {
        self.store.put_event_cursor(next_height)
    }
}
