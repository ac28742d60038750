//! Settlement reports sent back to the ledger.

use crate::ingest::canonical_json;
use crate::models::{Monitor, MonitorBucket, MonitorState, SettlementOutcome};
use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Namespace for deterministic report ids (uuid v5 over monitor id + outcome).
const REPORT_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3c4a_9b2e_4f70_8a15_c0de_5e77_1e01);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub report_id: Uuid,
    pub monitor_id: String,
    pub contract_id: String,
    pub location_id: String,
    pub outcome: SettlementOutcome,
    pub cumulative_tenths_mm: u64,
    pub strike_tenths_mm: u32,
    pub trigger_time: Option<i64>,
    pub first_crossing_at: Option<i64>,
    pub coverage_start: i64,
    pub coverage_end: i64,
    pub hours_observed: usize,
    pub hours_backfilled: usize,
    pub evidence_hash: String,
    pub signed_at: i64,
    #[serde(default)]
    pub signature: String,
}

/// BLAKE3 over `hour_start:tenths:backfilled` lines, in hour order.
pub fn evidence_hash(buckets: &[MonitorBucket]) -> String {
    let mut hasher = blake3::Hasher::new();
    for b in buckets {
        hasher.update(
            format!(
                "{}:{}:{}\n",
                b.hour_start, b.rainfall_tenths_mm, b.backfilled as u8
            )
            .as_bytes(),
        );
    }
    hasher.finalize().to_hex().to_string()
}

pub fn build_report(
    monitor: &Monitor,
    buckets: &[MonitorBucket],
    first_crossing_at: Option<i64>,
    now: i64,
) -> Result<SettlementReport> {
    let outcome = match monitor.state {
        MonitorState::Triggered => SettlementOutcome::Triggered,
        MonitorState::Matured => SettlementOutcome::Matured,
        other => return Err(anyhow!("monitor {} is {}, nothing to report", monitor.id, other)),
    };
    let outcome_tag = match outcome {
        SettlementOutcome::Triggered => "triggered",
        SettlementOutcome::Matured => "matured",
    };

    Ok(SettlementReport {
        report_id: Uuid::new_v5(
            &REPORT_NAMESPACE,
            format!("{}:{}", monitor.id, outcome_tag).as_bytes(),
        ),
        monitor_id: monitor.id.clone(),
        contract_id: monitor.contract_id.clone(),
        location_id: monitor.location_id.clone(),
        outcome,
        cumulative_tenths_mm: monitor.cumulative_tenths_mm,
        strike_tenths_mm: monitor.strike_tenths_mm,
        trigger_time: monitor.trigger_time,
        first_crossing_at,
        coverage_start: monitor.coverage_start,
        coverage_end: monitor.coverage_end,
        hours_observed: buckets.iter().filter(|b| !b.backfilled).count(),
        hours_backfilled: buckets.iter().filter(|b| b.backfilled).count(),
        evidence_hash: evidence_hash(buckets),
        signed_at: now,
        signature: String::new(),
    })
}

/// Signs reports with HMAC-SHA256 over the canonical report minus its signature.
#[derive(Clone)]
pub struct ReportSigner {
    secret: Vec<u8>,
}

impl ReportSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac_for(&self, report: &SettlementReport) -> Result<HmacSha256> {
        let mut unsigned = report.clone();
        unsigned.signature.clear();
        let value = serde_json::to_value(&unsigned).context("serialize report")?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| anyhow!("HMAC key error: {}", e))?;
        mac.update(canonical_json(&value).as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, report: &mut SettlementReport) -> Result<()> {
        let mac = self.mac_for(report)?;
        report.signature = hex::encode(mac.finalize().into_bytes());
        Ok(())
    }

    pub fn verify(&self, report: &SettlementReport) -> bool {
        let Ok(sig) = hex::decode(&report.signature) else {
            return false;
        };
        match self.mac_for(report) {
            Ok(mac) => mac.verify_slice(&sig).is_ok(),
            Err(_) => false,
        }
    }
}
