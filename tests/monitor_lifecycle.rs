//! End-to-end monitor lifecycle against an in-memory SQLite store and
//! scripted upstreams.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use rainwatch_backend::aggregator::CoverageError;
use rainwatch_backend::health::HealthTracker;
use rainwatch_backend::models::{
    ChainInfo, ContractCreated, ContractSettled, LedgerEvent, Monitor, MonitorState,
    SettlementOutcome,
};
use rainwatch_backend::monitor::{
    MonitorEngine, MonitorNotFound, ReportSigner, Transition, TransitionError,
};
use rainwatch_backend::scheduler::{
    ManualTicker, ResetReason, RestartGapDetector, RestartVerdict, SchedulerLoop,
};
use rainwatch_backend::storage::{ChainMetaStore, MonitorStore, SqliteStore};
use rainwatch_backend::upstream::HourlyReading;

const MONITOR_ID: &str = "nairobi:c1";

struct Harness {
    store: Arc<SqliteStore>,
    weather: Arc<ScriptedWeather>,
    ledger: Arc<MockLedger>,
    engine: Arc<MonitorEngine>,
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let weather = Arc::new(ScriptedWeather::default());
    let ledger = Arc::new(MockLedger::default());
    let engine = Arc::new(MonitorEngine::new(
        store.clone(),
        store.clone(),
        weather.clone(),
        ledger.clone(),
        ReportSigner::new(REPORTER_SECRET),
        Arc::new(HealthTracker::new()),
    ));
    Harness {
        store,
        weather,
        ledger,
        engine,
    }
}

fn audit_kinds(h: &Harness) -> Vec<String> {
    h.store
        .audit_trail(MONITOR_ID)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

/// Ten hours of 1.0mm on record, then a 6.0mm hour pushes the total past a
/// 15.0mm strike.
async fn create_and_cross(h: &Harness) {
    h.weather.set_readings(hourly(T0, T0 + 10 * H, 10));
    h.engine
        .handle_event(created("c1", T0, T0 + 48 * H, 150), T0 + 10 * H)
        .await
        .unwrap();

    let mut readings = hourly(T0, T0 + 10 * H, 10);
    readings.push(HourlyReading {
        hour_start: T0 + 10 * H,
        rainfall_tenths_mm: 60,
    });
    h.weather.set_readings(readings);
}

#[tokio::test]
async fn test_created_event_is_idempotent() {
    let h = harness();
    h.weather.set_readings(hourly(T0, T0 + 10 * H, 10));

    let event = created("c1", T0, T0 + 48 * H, 150);
    h.engine.handle_event(event.clone(), T0 + 10 * H).await.unwrap();
    h.engine.handle_event(event, T0 + 11 * H).await.unwrap();

    let monitors = h.store.monitors(None).unwrap();
    assert_eq!(monitors.len(), 1);
    let monitor = &monitors[0];
    assert_eq!(monitor.id, MONITOR_ID);
    assert_eq!(monitor.state, MonitorState::Monitoring);
    assert_eq!(monitor.created_at, T0 + 10 * H);
    // Initial backfill pulled the ten recorded hours.
    assert_eq!(monitor.cumulative_tenths_mm, 100);

    let kinds = audit_kinds(&h);
    assert_eq!(kinds.iter().filter(|k| *k == "created").count(), 1);
}

#[tokio::test]
async fn test_hour_containing_coverage_start_counts_in_full() {
    let h = harness();
    h.weather.set_readings(hourly(T0, T0 + 3 * H, 10));
    h.engine
        .handle_event(created("c1", T0 + H / 2, T0 + 48 * H, 150), T0 + 3 * H)
        .await
        .unwrap();

    let monitor = h.engine.monitor(MONITOR_ID).unwrap();
    assert_eq!(monitor.coverage_start, T0 + H / 2);
    // The T0 hour starts before coverage but is summed whole.
    assert_eq!(monitor.cumulative_tenths_mm, 30);
    let buckets = h.store.monitor_buckets(MONITOR_ID, T0, T0 + 3 * H).unwrap();
    assert_eq!(buckets.first().map(|b| b.hour_start), Some(T0));
}

#[tokio::test]
async fn test_created_event_with_bad_window_is_rejected() {
    let h = harness();
    let err = h
        .engine
        .handle_event(created("c1", T0 + 5 * H, T0, 150), T0)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CoverageError>(),
        Some(CoverageError::EmptyWindow { .. })
    ));
    assert!(h.store.monitors(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_trigger_then_accepted_report() {
    let h = harness();
    create_and_cross(&h).await;

    let now = T0 + 11 * H;
    let outcome = h.engine.evaluate_monitor(MONITOR_ID, now).await.unwrap();
    assert_eq!(outcome.previous_state, MonitorState::Monitoring);
    assert_eq!(outcome.transition, Some(Transition::Trigger));
    assert_eq!(outcome.cumulative_tenths_mm, 160);
    assert_eq!(outcome.state, MonitorState::Reported);
    assert!(outcome.report.as_ref().unwrap().accepted);

    let monitor = h.engine.monitor(MONITOR_ID).unwrap();
    assert_eq!(monitor.state, MonitorState::Reported);
    assert_eq!(monitor.trigger_time, Some(now));
    assert_eq!(monitor.last_fetch_at, Some(now));

    let reports = h.ledger.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.outcome, SettlementOutcome::Triggered);
    assert_eq!(report.cumulative_tenths_mm, 160);
    assert_eq!(report.first_crossing_at, Some(T0 + 10 * H));
    assert_eq!(report.hours_observed, 11);
    assert_eq!(report.hours_backfilled, 0);
    assert!(ReportSigner::new(REPORTER_SECRET).verify(report));
    assert!(!ReportSigner::new("some-other-secret").verify(report));

    assert_eq!(
        audit_kinds(&h),
        vec!["created", "backfill", "triggered", "reported"]
    );
}

#[tokio::test]
async fn test_rejected_report_is_retried_by_cycle() {
    let h = harness();
    create_and_cross(&h).await;
    h.ledger.set_accept(false);

    let outcome = h
        .engine
        .evaluate_monitor(MONITOR_ID, T0 + 11 * H)
        .await
        .unwrap();
    assert_eq!(outcome.state, MonitorState::Triggered);
    assert!(!outcome.report.unwrap().accepted);
    assert_eq!(
        h.engine.monitor(MONITOR_ID).unwrap().state,
        MonitorState::Triggered
    );

    h.ledger.set_accept(true);
    let summary = h.engine.run_cycle(T0 + 12 * H).await.unwrap();
    assert_eq!(summary.evaluated, 0);
    assert_eq!(summary.reports_submitted, 1);
    assert_eq!(summary.reports_accepted, 1);
    assert_eq!(summary.report_failures, 0);
    assert_eq!(
        h.engine.monitor(MONITOR_ID).unwrap().state,
        MonitorState::Reported
    );

    // Both attempts carry the same deterministic report id.
    let reports = h.ledger.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].report_id, reports[1].report_id);
    assert!(audit_kinds(&h).contains(&"report_rejected".to_string()));
}

#[tokio::test]
async fn test_dry_window_matures_through_cycle() {
    let h = harness();
    h.weather.set_readings(hourly(T0, T0 + 2 * H, 1));
    h.engine
        .handle_event(created("c1", T0, T0 + 5 * H, 10_000), T0 + 2 * H)
        .await
        .unwrap();

    h.weather.set_readings(hourly(T0, T0 + 6 * H, 1));
    let summary = h.engine.run_cycle(T0 + 6 * H).await.unwrap();
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.matured, 1);
    assert_eq!(summary.triggered, 0);
    assert_eq!(summary.reports_accepted, 1);

    let monitor = h.engine.monitor(MONITOR_ID).unwrap();
    assert_eq!(monitor.state, MonitorState::Reported);
    // Only hours starting before coverage_end count.
    assert_eq!(monitor.cumulative_tenths_mm, 5);
    assert_eq!(monitor.trigger_time, None);

    let reports = h.ledger.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, SettlementOutcome::Matured);
    assert_eq!(reports[0].first_crossing_at, None);
}

#[tokio::test]
async fn test_cycle_leaves_quiet_monitor_alone() {
    let h = harness();
    h.weather.set_readings(hourly(T0, T0 + 3 * H, 2));
    h.engine
        .handle_event(created("c1", T0, T0 + 48 * H, 150), T0 + 3 * H)
        .await
        .unwrap();

    let summary = h.engine.run_cycle(T0 + 4 * H).await.unwrap();
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.triggered + summary.matured, 0);
    assert_eq!(summary.reports_submitted, 0);
    assert!(h.ledger.reports().is_empty());
    assert_eq!(
        h.engine.monitor(MONITOR_ID).unwrap().state,
        MonitorState::Monitoring
    );
}

#[tokio::test]
async fn test_settled_event_closes_monitor_once() {
    let h = harness();
    h.weather.set_readings(Vec::new());
    h.engine
        .handle_event(created("c1", T0, T0 + 48 * H, 150), T0 + H)
        .await
        .unwrap();

    let settled = LedgerEvent::ContractSettled(ContractSettled {
        contract_id: "c1".to_string(),
        outcome: SettlementOutcome::Triggered,
        cumulative_tenths_mm: 200,
        evidence_hash: "ab".repeat(32),
    });
    h.engine.handle_event(settled.clone(), T0 + 2 * H).await.unwrap();
    h.engine.handle_event(settled, T0 + 3 * H).await.unwrap();

    let monitor = h.engine.monitor(MONITOR_ID).unwrap();
    assert_eq!(monitor.state, MonitorState::Reported);
    assert_eq!(monitor.trigger_time, Some(T0 + 2 * H));
    let kinds = audit_kinds(&h);
    assert_eq!(kinds.iter().filter(|k| *k == "settled").count(), 1);
    // Settled elsewhere: nothing is submitted from here.
    assert!(h.ledger.reports().is_empty());
}

#[tokio::test]
async fn test_replayed_settlement_does_not_undo_reset() {
    let h = harness();
    h.weather.set_readings(Vec::new());
    h.engine
        .handle_event(created("c1", T0, T0 + 48 * H, 150), T0 + H)
        .await
        .unwrap();

    let settled = LedgerEvent::ContractSettled(ContractSettled {
        contract_id: "c1".to_string(),
        outcome: SettlementOutcome::Triggered,
        cumulative_tenths_mm: 200,
        evidence_hash: "cd".repeat(32),
    });
    h.engine.handle_event(settled.clone(), T0 + 2 * H).await.unwrap();
    assert_eq!(
        h.engine.monitor(MONITOR_ID).unwrap().state,
        MonitorState::Reported
    );

    h.engine.reset_monitor(MONITOR_ID, T0 + 3 * H).unwrap();
    // The ledger replays its history after a reconnect.
    h.engine.handle_event(settled, T0 + 4 * H).await.unwrap();

    let monitor = h.engine.monitor(MONITOR_ID).unwrap();
    assert_eq!(monitor.state, MonitorState::Monitoring);
    assert_eq!(monitor.trigger_time, None);
    assert_eq!(
        audit_kinds(&h).last().map(String::as_str),
        Some("reset")
    );
}

#[tokio::test]
async fn test_admin_reset_and_invalid_transitions() {
    let h = harness();
    create_and_cross(&h).await;

    // Nothing is owed yet.
    let err = h
        .engine
        .submit_report(MONITOR_ID, T0 + 10 * H)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<TransitionError>().is_some());

    h.engine
        .evaluate_monitor(MONITOR_ID, T0 + 11 * H)
        .await
        .unwrap();
    let monitor = h.engine.reset_monitor(MONITOR_ID, T0 + 12 * H).unwrap();
    assert_eq!(monitor.state, MonitorState::Monitoring);
    assert_eq!(monitor.trigger_time, None);

    let err = h.engine.reset_monitor(MONITOR_ID, T0 + 13 * H).unwrap_err();
    let transition = err.downcast_ref::<TransitionError>().unwrap();
    assert_eq!(transition.from, MonitorState::Monitoring);
    assert_eq!(transition.transition, Transition::Reset);

    let err = h
        .engine
        .evaluate_monitor("nairobi:missing", T0 + 13 * H)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<MonitorNotFound>().is_some());
}

#[tokio::test]
async fn test_backfill_zero_fills_unrecoverable_hours() {
    let h = harness();
    h.weather.set_down(true);
    let now = T0 + 30 * H;
    h.engine
        .handle_event(created("c1", T0, T0 + 48 * H, 500), now)
        .await
        .unwrap();

    // Hours older than the provider lookback are placeholders, the rest wait.
    let buckets = h.store.monitor_buckets(MONITOR_ID, T0, now).unwrap();
    assert_eq!(buckets.len(), 6);
    assert!(buckets.iter().all(|b| b.backfilled && b.rainfall_tenths_mm == 0));
    assert_eq!(buckets.last().unwrap().hour_start, T0 + 5 * H);

    let retry = h.engine.backfill(MONITOR_ID, now).await.unwrap();
    assert_eq!(retry.missing_hours, 24);
    assert_eq!(retry.filled_zero, 0);
    assert_eq!(retry.still_missing.len(), 24);
    assert!(retry.historical_fetch_error.is_some());

    h.weather.set_down(false);
    h.weather.set_readings(hourly(T0 + 6 * H, now, 5));
    let report = h.engine.backfill(MONITOR_ID, now).await.unwrap();
    assert_eq!(report.range_start, T0);
    assert_eq!(report.range_end, now);
    assert_eq!(report.filled_real, 24);
    assert!(report.still_missing.is_empty());
    assert!(report.historical_fetch_error.is_none());

    let monitor = h.engine.monitor(MONITOR_ID).unwrap();
    assert_eq!(monitor.cumulative_tenths_mm, 120);

    // Nothing left to do.
    let again = h.engine.backfill(MONITOR_ID, now).await.unwrap();
    assert_eq!(again.missing_hours, 0);
}

#[tokio::test]
async fn test_scheduler_runs_cycle_on_tick() {
    let h = harness();
    create_and_cross(&h).await;

    let (ticker, trigger) = ManualTicker::channel();
    let handle =
        SchedulerLoop::new(h.engine.clone(), Box::new(ticker), fixed_clock(T0 + 11 * H)).spawn();
    let mut completed = handle.completed();

    assert!(trigger.fire().await);
    tokio::time::timeout(Duration::from_secs(5), completed.changed())
        .await
        .expect("cycle did not complete")
        .unwrap();

    let summary = completed.borrow().clone().unwrap();
    assert_eq!(summary.started_at, T0 + 11 * H);
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.triggered, 1);
    assert_eq!(summary.reports_accepted, 1);

    handle.stop().await;
    assert_eq!(
        h.engine.monitor(MONITOR_ID).unwrap().state,
        MonitorState::Reported
    );
}

#[test]
fn test_restart_detection_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rainwatch.db");
    let chain = |genesis: &str, height: u64| ChainInfo {
        genesis_hash: genesis.to_string(),
        height,
    };

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let detector = RestartGapDetector::new(store.clone());
        assert_eq!(
            detector.check(&chain("g1", 100)).unwrap(),
            RestartVerdict::FirstSeen
        );
        let created = ContractCreated {
            contract_id: "c1".to_string(),
            location_id: "nairobi".to_string(),
            coverage_start: T0,
            coverage_end: T0 + 24 * H,
            strike_tenths_mm: 150,
            lat: LAT,
            lon: LON,
        };
        store
            .insert_monitor_if_absent(&Monitor::from_created(&created, T0))
            .unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let detector = RestartGapDetector::new(store.clone());

    // A small regression is a reorg, not a restart.
    assert_eq!(
        detector.check(&chain("g1", 95)).unwrap(),
        RestartVerdict::Continuous
    );
    assert_eq!(detector.last_height().unwrap(), Some(100));
    assert_eq!(store.monitors(None).unwrap().len(), 1);

    match detector.check(&chain("g1", 50)).unwrap() {
        RestartVerdict::Reset { reason, cleared } => {
            assert_eq!(
                reason,
                ResetReason::HeightRegressed {
                    previous: 100,
                    current: 50
                }
            );
            assert_eq!(cleared.monitors, 1);
        }
        other => panic!("expected reset, got {:?}", other),
    }
    assert!(store.monitors(None).unwrap().is_empty());
    assert_eq!(store.chain_meta().unwrap(), Some(chain("g1", 50)));

    assert!(matches!(
        detector.check(&chain("g2", 60)).unwrap(),
        RestartVerdict::Reset {
            reason: ResetReason::GenesisChanged { .. },
            ..
        }
    ));
}
