//! Monitor engine
//!
//! Single entry point for everything that mutates a monitor: ledger events,
//! scheduled and manual evaluation, report submission, backfill and admin reset.

use crate::aggregator::{
    first_crossing, validate_window, MonitorRainfall, SampleRejection, TimeBucketAggregator,
};
use crate::health::{HealthTracker, Subsystem};
use crate::models::{
    hour_floor, ContractCreated, ContractSettled, LedgerEvent, Monitor, MonitorAuditEntry,
    MonitorBucket, MonitorState, SettlementOutcome, UpsertOutcome,
};
use crate::monitor::backfill::{backfill_range, missing_hours, plan_fills, BackfillReport, Fill};
use crate::monitor::report::{build_report, ReportSigner};
use crate::monitor::state::{next_state, Transition};
use crate::storage::{MonitorStore, RainBucketStore};
use crate::upstream::{HourlyReading, SettlementLedger, WeatherProvider};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorNotFound(pub String);

impl fmt::Display for MonitorNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor {} not found", self.0)
    }
}

impl std::error::Error for MonitorNotFound {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportOutcome {
    pub monitor_id: String,
    pub report_id: Uuid,
    pub accepted: bool,
    pub state: MonitorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationOutcome {
    pub monitor_id: String,
    pub previous_state: MonitorState,
    pub state: MonitorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
    pub cumulative_tenths_mm: u64,
    /// Provider readings stored for this monitor.
    pub fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_error: Option<String>,
}

impl EvaluationOutcome {
    pub fn transitioned(&self) -> bool {
        self.transition.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub started_at: i64,
    pub evaluated: usize,
    pub triggered: usize,
    pub matured: usize,
    pub evaluation_failures: usize,
    pub reports_submitted: usize,
    pub reports_accepted: usize,
    pub report_failures: usize,
}

pub struct MonitorEngine {
    monitors: Arc<dyn MonitorStore>,
    aggregator: TimeBucketAggregator<dyn RainBucketStore>,
    weather: Arc<dyn WeatherProvider>,
    ledger: Arc<dyn SettlementLedger>,
    signer: ReportSigner,
    health: Arc<HealthTracker>,
}

impl MonitorEngine {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        rain: Arc<dyn RainBucketStore>,
        weather: Arc<dyn WeatherProvider>,
        ledger: Arc<dyn SettlementLedger>,
        signer: ReportSigner,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            monitors,
            aggregator: TimeBucketAggregator::new(rain),
            weather,
            ledger,
            signer,
            health,
        }
    }

    pub fn store(&self) -> &Arc<dyn MonitorStore> {
        &self.monitors
    }

    pub fn aggregator(&self) -> &TimeBucketAggregator<dyn RainBucketStore> {
        &self.aggregator
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn monitor(&self, id: &str) -> Result<Monitor> {
        self.monitors
            .monitor(id)?
            .ok_or_else(|| MonitorNotFound(id.to_string()).into())
    }

    fn audit(&self, monitor_id: &str, now: i64, kind: &str, detail: Value) -> Result<()> {
        self.monitors.append_audit(&MonitorAuditEntry {
            monitor_id: monitor_id.to_string(),
            at: now,
            kind: kind.to_string(),
            detail,
        })
    }

    fn transition(&self, monitor: &mut Monitor, transition: Transition, now: i64) -> Result<()> {
        let from = monitor.state;
        monitor.state = next_state(from, transition)?;
        match transition {
            Transition::Trigger => monitor.trigger_time = Some(now),
            Transition::Reset => monitor.trigger_time = None,
            Transition::Mature | Transition::Report => {}
        }
        monitor.updated_at = now;
        info!(
            monitor_id = %monitor.id,
            from = %from,
            to = %monitor.state,
            "Monitor transition"
        );
        Ok(())
    }

    // ===== Ledger events =====

    pub async fn handle_event(&self, event: LedgerEvent, now: i64) -> Result<()> {
        match event {
            LedgerEvent::ContractCreated(created) => self.on_created(created, now).await,
            LedgerEvent::ContractSettled(settled) => self.on_settled(settled, now),
        }
    }

    async fn on_created(&self, created: ContractCreated, now: i64) -> Result<()> {
        validate_window(created.coverage_start, created.coverage_end)?;

        let monitor = Monitor::from_created(&created, now);
        match self.monitors.insert_monitor_if_absent(&monitor)? {
            UpsertOutcome::AlreadyPresent => {
                debug!(monitor_id = %monitor.id, "Replayed ContractCreated ignored");
                return Ok(());
            }
            UpsertOutcome::Inserted => {}
        }

        self.audit(
            &monitor.id,
            now,
            "created",
            json!({
                "coverage_start": monitor.coverage_start,
                "coverage_end": monitor.coverage_end,
                "strike_tenths_mm": monitor.strike_tenths_mm,
            }),
        )?;
        info!(
            monitor_id = %monitor.id,
            strike = monitor.strike_tenths_mm,
            coverage_start = monitor.coverage_start,
            coverage_end = monitor.coverage_end,
            "Monitor created"
        );

        if let Err(e) = self.backfill(&monitor.id, now).await {
            warn!(monitor_id = %monitor.id, error = %e, "Initial backfill failed");
        }
        Ok(())
    }

    fn on_settled(&self, settled: ContractSettled, now: i64) -> Result<()> {
        let monitors = self.monitors.monitors_for_contract(&settled.contract_id)?;
        if monitors.is_empty() {
            debug!(contract_id = %settled.contract_id, "Settlement for unknown contract");
        }

        for mut monitor in monitors {
            if monitor.state == MonitorState::Reported {
                continue;
            }
            if self.reset_since_settlement(&monitor.id)? {
                // Replayed settlements must not undo an operator reset.
                info!(
                    monitor_id = %monitor.id,
                    contract_id = %settled.contract_id,
                    "Settlement ignored for reset monitor"
                );
                continue;
            }
            let from = monitor.state;
            if from == MonitorState::Monitoring {
                let step = match settled.outcome {
                    SettlementOutcome::Triggered => Transition::Trigger,
                    SettlementOutcome::Matured => Transition::Mature,
                };
                self.transition(&mut monitor, step, now)?;
            }
            self.transition(&mut monitor, Transition::Report, now)?;
            self.monitors.save_monitor(&monitor)?;
            self.audit(
                &monitor.id,
                now,
                "settled",
                json!({
                    "from": from,
                    "outcome": settled.outcome,
                    "cumulative_tenths_mm": settled.cumulative_tenths_mm,
                    "evidence_hash": settled.evidence_hash,
                }),
            )?;
        }
        Ok(())
    }

    /// True when an admin reset is the most recent of the monitor's
    /// `reset`/`settled` audit entries.
    fn reset_since_settlement(&self, monitor_id: &str) -> Result<bool> {
        let trail = self.monitors.audit_trail(monitor_id)?;
        let last_of = |kind: &str| trail.iter().rposition(|e| e.kind == kind);
        Ok(last_of("reset") > last_of("settled"))
    }

    // ===== Evaluation =====

    /// Store provider readings for `monitor` and mirror them into the
    /// location's rolling aggregate. Returns the number of monitor buckets written.
    fn store_readings(
        &self,
        monitor: &Monitor,
        readings: &[HourlyReading],
        now: i64,
    ) -> Result<usize> {
        let coverage_from = hour_floor(monitor.coverage_start);
        let mut stored = 0;

        for reading in readings {
            if reading.hour_start >= coverage_from && reading.hour_start < monitor.coverage_end {
                self.monitors.upsert_monitor_bucket(&MonitorBucket {
                    monitor_id: monitor.id.clone(),
                    hour_start: reading.hour_start,
                    rainfall_tenths_mm: reading.rainfall_tenths_mm,
                    backfilled: false,
                    fetched_at: now,
                })?;
                stored += 1;
            }

            if let Err(e) = self.aggregator.submit_sample(
                &monitor.location_id,
                reading.hour_start,
                reading.rainfall_tenths_mm,
                now,
            ) {
                match e.downcast_ref::<SampleRejection>() {
                    Some(rejection) => warn!(
                        location_id = %monitor.location_id,
                        hour_start = reading.hour_start,
                        reason = rejection.code(),
                        "Provider reading rejected by aggregator"
                    ),
                    None => return Err(e),
                }
            }
        }
        Ok(stored)
    }

    /// Hourly buckets are the finest resolution the provider reports, so the
    /// hour containing `coverage_start` counts in full. This matches the
    /// range backfill fills, `[hour_floor(coverage_start), min(coverage_end, now))`.
    fn cumulative(&self, monitor: &Monitor, now: i64) -> Result<u64> {
        let (from, to) = backfill_range(monitor.coverage_start, monitor.coverage_end, now);
        let buckets = self.monitors.monitor_buckets(&monitor.id, from, to)?;
        Ok(buckets.iter().map(|b| b.rainfall_tenths_mm as u64).sum())
    }

    pub async fn evaluate_monitor(&self, id: &str, now: i64) -> Result<EvaluationOutcome> {
        let mut monitor = self.monitor(id)?;
        let previous_state = monitor.state;

        let (fetched, fetch_error) = match self
            .weather
            .last_24_hours(monitor.lat, monitor.lon, now)
            .await
        {
            Ok(readings) => {
                self.health.record_success(Subsystem::Weather, now);
                let stored = self.store_readings(&monitor, &readings, now)?;
                monitor.last_fetch_at = Some(now);
                (stored, None)
            }
            Err(e) => {
                self.health.record_failure(Subsystem::Weather, now, &e);
                warn!(monitor_id = %monitor.id, error = %e, "Weather fetch failed, using stored buckets");
                (0, Some(format!("{:#}", e)))
            }
        };

        monitor.cumulative_tenths_mm = self.cumulative(&monitor, now)?;
        monitor.updated_at = now;

        let step = if monitor.state != MonitorState::Monitoring {
            None
        } else if monitor.cumulative_tenths_mm >= monitor.strike_tenths_mm as u64 {
            Some(Transition::Trigger)
        } else if now >= monitor.coverage_end {
            Some(Transition::Mature)
        } else {
            None
        };
        if let Some(step) = step {
            self.transition(&mut monitor, step, now)?;
        }

        self.monitors.save_monitor(&monitor)?;

        let mut outcome = EvaluationOutcome {
            monitor_id: monitor.id.clone(),
            previous_state,
            state: monitor.state,
            transition: step,
            cumulative_tenths_mm: monitor.cumulative_tenths_mm,
            fetched,
            fetch_error,
            report: None,
            report_error: None,
        };

        if outcome.transitioned() {
            self.audit(
                &monitor.id,
                now,
                monitor.state.as_str(),
                json!({
                    "cumulative_tenths_mm": monitor.cumulative_tenths_mm,
                    "strike_tenths_mm": monitor.strike_tenths_mm,
                }),
            )?;
            match self.submit_report(&monitor.id, now).await {
                Ok(report) => {
                    outcome.state = report.state;
                    outcome.report = Some(report);
                }
                Err(e) => {
                    warn!(monitor_id = %monitor.id, error = %e, "Report submission failed");
                    outcome.report_error = Some(format!("{:#}", e));
                }
            }
        }

        debug!(
            monitor_id = %outcome.monitor_id,
            cumulative = outcome.cumulative_tenths_mm,
            state = %outcome.state,
            fetched = outcome.fetched,
            "Monitor evaluated"
        );
        Ok(outcome)
    }

    // ===== Reporting =====

    pub async fn submit_report(&self, id: &str, now: i64) -> Result<ReportOutcome> {
        let mut monitor = self.monitor(id)?;
        if !monitor.state.awaiting_report() {
            // Report is only legal from triggered/matured; surface the typed error.
            next_state(monitor.state, Transition::Report)?;
        }

        let buckets = self.monitors.monitor_buckets(
            &monitor.id,
            hour_floor(monitor.coverage_start),
            monitor.coverage_end,
        )?;
        let crossing = {
            let source = MonitorRainfall {
                store: self.monitors.as_ref(),
                monitor_id: &monitor.id,
            };
            first_crossing(
                &source,
                monitor.strike_tenths_mm,
                monitor.coverage_start,
                monitor.coverage_end,
            )?
        };

        let mut report = build_report(&monitor, &buckets, crossing.map(|c| c.at), now)?;
        self.signer.sign(&mut report)?;

        let receipt = match self.ledger.submit_report(&report).await {
            Ok(receipt) => {
                self.health.record_success(Subsystem::Ledger, now);
                receipt
            }
            Err(e) => {
                self.health.record_failure(Subsystem::Ledger, now, &e);
                return Err(e).context("submit settlement report");
            }
        };

        if receipt.accepted {
            self.transition(&mut monitor, Transition::Report, now)?;
            self.monitors.save_monitor(&monitor)?;
            self.audit(
                &monitor.id,
                now,
                "reported",
                json!({
                    "report_id": report.report_id,
                    "evidence_hash": report.evidence_hash,
                    "tx_hash": receipt.tx_hash,
                }),
            )?;
        } else {
            warn!(
                monitor_id = %monitor.id,
                reason = receipt.reason.as_deref().unwrap_or("unspecified"),
                "Ledger rejected settlement report"
            );
            self.audit(
                &monitor.id,
                now,
                "report_rejected",
                json!({ "report_id": report.report_id, "reason": receipt.reason }),
            )?;
        }

        Ok(ReportOutcome {
            monitor_id: monitor.id,
            report_id: report.report_id,
            accepted: receipt.accepted,
            state: monitor.state,
            tx_hash: receipt.tx_hash,
            reason: receipt.reason,
        })
    }

    // ===== Backfill =====

    pub async fn backfill(&self, id: &str, now: i64) -> Result<BackfillReport> {
        let mut monitor = self.monitor(id)?;
        let (range_start, range_end) =
            backfill_range(monitor.coverage_start, monitor.coverage_end, now);

        let existing: BTreeSet<i64> = self
            .monitors
            .monitor_buckets(&monitor.id, range_start, range_end)?
            .into_iter()
            .map(|b| b.hour_start)
            .collect();
        let missing = missing_hours(&existing, range_start, range_end);

        let mut report = BackfillReport {
            monitor_id: monitor.id.clone(),
            range_start,
            range_end,
            missing_hours: missing.len(),
            ..Default::default()
        };
        if missing.is_empty() {
            return Ok(report);
        }

        let feed = match self
            .weather
            .last_24_hours(monitor.lat, monitor.lon, now)
            .await
        {
            Ok(readings) => {
                self.health.record_success(Subsystem::Weather, now);
                Some(readings)
            }
            Err(e) => {
                self.health.record_failure(Subsystem::Weather, now, &e);
                warn!(monitor_id = %monitor.id, error = %e, "Historical fetch failed");
                report.historical_fetch_error = Some(format!("{:#}", e));
                None
            }
        };

        let mut real = Vec::new();
        for (hour_start, fill) in plan_fills(&missing, feed.as_deref(), now) {
            match fill {
                Fill::Real(tenths) => {
                    real.push(HourlyReading {
                        hour_start,
                        rainfall_tenths_mm: tenths,
                    });
                    report.filled_real += 1;
                }
                Fill::Zero => {
                    self.monitors.upsert_monitor_bucket(&MonitorBucket {
                        monitor_id: monitor.id.clone(),
                        hour_start,
                        rainfall_tenths_mm: 0,
                        backfilled: true,
                        fetched_at: now,
                    })?;
                    report.filled_zero += 1;
                }
                Fill::Unavailable => report.still_missing.push(hour_start),
            }
        }
        self.store_readings(&monitor, &real, now)?;

        if report.filled_real + report.filled_zero > 0 {
            monitor.cumulative_tenths_mm = self.cumulative(&monitor, now)?;
            monitor.updated_at = now;
            self.monitors.save_monitor(&monitor)?;
            self.audit(
                &monitor.id,
                now,
                "backfill",
                json!({
                    "filled_real": report.filled_real,
                    "filled_zero": report.filled_zero,
                    "still_missing": report.still_missing.len(),
                }),
            )?;
        }

        info!(
            monitor_id = %monitor.id,
            missing = report.missing_hours,
            real = report.filled_real,
            zero = report.filled_zero,
            still_missing = report.still_missing.len(),
            "Backfill complete"
        );
        Ok(report)
    }

    // ===== Admin =====

    pub fn reset_monitor(&self, id: &str, now: i64) -> Result<Monitor> {
        let mut monitor = self.monitor(id)?;
        let from = monitor.state;
        self.transition(&mut monitor, Transition::Reset, now)?;
        self.monitors.save_monitor(&monitor)?;
        self.audit(&monitor.id, now, "reset", json!({ "from": from }))?;
        warn!(monitor_id = %monitor.id, from = %from, "Monitor reset by admin");
        Ok(monitor)
    }

    // ===== Scheduler cycle =====

    /// Evaluate every `monitoring` monitor, then retry reports still owed to
    /// the ledger. Per-monitor failures are counted, never propagated.
    pub async fn run_cycle(&self, now: i64) -> Result<CycleSummary> {
        let mut summary = CycleSummary {
            started_at: now,
            ..Default::default()
        };

        let active = match self.monitors.monitors(Some(MonitorState::Monitoring)) {
            Ok(monitors) => monitors,
            Err(e) => {
                self.health.record_failure(Subsystem::Database, now, &e);
                self.health.record_failure(Subsystem::Scheduler, now, &e);
                return Err(e).context("list monitoring monitors");
            }
        };

        let mut submitted: HashSet<String> = HashSet::new();
        for monitor in &active {
            match self.evaluate_monitor(&monitor.id, now).await {
                Ok(outcome) => {
                    summary.evaluated += 1;
                    match outcome.transition {
                        Some(Transition::Trigger) => summary.triggered += 1,
                        Some(Transition::Mature) => summary.matured += 1,
                        _ => {}
                    }
                    if outcome.transitioned() {
                        summary.reports_submitted += 1;
                        match &outcome.report {
                            Some(r) if r.accepted => summary.reports_accepted += 1,
                            Some(_) => {}
                            None => summary.report_failures += 1,
                        }
                        submitted.insert(outcome.monitor_id);
                    }
                }
                Err(e) => {
                    summary.evaluation_failures += 1;
                    warn!(monitor_id = %monitor.id, error = %e, "Evaluation failed");
                }
            }
        }

        let mut pending = Vec::new();
        for state in [MonitorState::Triggered, MonitorState::Matured] {
            pending.extend(self.monitors.monitors(Some(state))?);
        }
        for monitor in pending.iter().filter(|m| !submitted.contains(&m.id)) {
            summary.reports_submitted += 1;
            match self.submit_report(&monitor.id, now).await {
                Ok(r) if r.accepted => summary.reports_accepted += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.report_failures += 1;
                    warn!(monitor_id = %monitor.id, error = %e, "Report retry failed");
                }
            }
        }

        self.health.record_success(Subsystem::Scheduler, now);
        info!(
            evaluated = summary.evaluated,
            triggered = summary.triggered,
            matured = summary.matured,
            failures = summary.evaluation_failures,
            reports_accepted = summary.reports_accepted,
            "Scheduler cycle complete"
        );
        Ok(summary)
    }
}
