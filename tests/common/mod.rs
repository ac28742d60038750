//! Scripted upstreams shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rainwatch_backend::models::{ChainInfo, ContractCreated, LedgerEvent};
use rainwatch_backend::monitor::SettlementReport;
use rainwatch_backend::scheduler::Clock;
use rainwatch_backend::upstream::{
    EventEnvelope, EventPage, HourlyReading, SettlementLedger, SubmissionReceipt, WeatherProvider,
};

pub const H: i64 = 3_600;
/// An hour boundary.
pub const T0: i64 = 1_700_000_000 / H * H;
pub const REPORTER_SECRET: &str = "reporter-test-secret-0123456789abcdef";
pub const LAT: f64 = -1.2921;
pub const LON: f64 = 36.8219;

pub fn fixed_clock(now: i64) -> Clock {
    Arc::new(move || now)
}

/// Same rainfall for every hour in `[from, to)`.
pub fn hourly(from: i64, to: i64, tenths: u32) -> Vec<HourlyReading> {
    (0..)
        .map(|i| from + i * H)
        .take_while(|h| *h < to)
        .map(|hour_start| HourlyReading {
            hour_start,
            rainfall_tenths_mm: tenths,
        })
        .collect()
}

pub fn created(contract_id: &str, start: i64, end: i64, strike: u32) -> LedgerEvent {
    LedgerEvent::ContractCreated(ContractCreated {
        contract_id: contract_id.to_string(),
        location_id: "nairobi".to_string(),
        coverage_start: start,
        coverage_end: end,
        strike_tenths_mm: strike,
        lat: LAT,
        lon: LON,
    })
}

/// Weather provider returning whatever readings the test scripted.
#[derive(Default)]
pub struct ScriptedWeather {
    readings: Mutex<Vec<HourlyReading>>,
    down: AtomicBool,
}

impl ScriptedWeather {
    pub fn set_readings(&self, readings: Vec<HourlyReading>) {
        *self.readings.lock() = readings;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl WeatherProvider for ScriptedWeather {
    async fn last_24_hours(&self, _lat: f64, _lon: f64, _now: i64) -> Result<Vec<HourlyReading>> {
        if self.down.load(Ordering::SeqCst) {
            bail!("weather provider unavailable");
        }
        Ok(self.readings.lock().clone())
    }
}

/// In-memory ledger that records every report it is sent.
pub struct MockLedger {
    chain: Mutex<ChainInfo>,
    events: Mutex<Vec<EventEnvelope>>,
    accept: AtomicBool,
    reports: Mutex<Vec<SettlementReport>>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            chain: Mutex::new(ChainInfo {
                genesis_hash: "genesis-a".to_string(),
                height: 100,
            }),
            events: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
            reports: Mutex::new(Vec::new()),
        }
    }
}

impl MockLedger {
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<SettlementReport> {
        self.reports.lock().clone()
    }

    pub fn push_event(&self, height: u64, event: LedgerEvent) {
        self.events.lock().push(EventEnvelope { height, event });
    }
}

#[async_trait]
impl SettlementLedger for MockLedger {
    async fn chain_info(&self) -> Result<ChainInfo> {
        Ok(self.chain.lock().clone())
    }

    async fn poll_events(&self, from_height: u64) -> Result<EventPage> {
        let events = self
            .events
            .lock()
            .iter()
            .filter(|e| e.height >= from_height)
            .cloned()
            .collect();
        Ok(EventPage {
            events,
            height: self.chain.lock().height,
        })
    }

    async fn submit_report(&self, report: &SettlementReport) -> Result<SubmissionReceipt> {
        self.reports.lock().push(report.clone());
        if self.accept.load(Ordering::SeqCst) {
            Ok(SubmissionReceipt {
                accepted: true,
                tx_hash: Some(format!("0x{}", &report.evidence_hash[..16])),
                reason: None,
            })
        } else {
            Ok(SubmissionReceipt {
                accepted: false,
                tx_hash: None,
                reason: Some("contract paused".to_string()),
            })
        }
    }
}
