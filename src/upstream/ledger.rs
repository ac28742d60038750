//! Settlement ledger client
//!
//! The ledger is an external collaborator: we read its identity and height,
//! poll its contract lifecycle events and submit signed settlement reports.

use crate::models::{ChainInfo, LedgerEvent};
use crate::monitor::SettlementReport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub height: u64,
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<EventEnvelope>,
    /// Ledger height the page was read at.
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub accepted: bool,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait SettlementLedger: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo>;
    /// Events at heights `>= from_height`.
    async fn poll_events(&self, from_height: u64) -> Result<EventPage>;
    async fn submit_report(&self, report: &SettlementReport) -> Result<SubmissionReceipt>;
}

#[derive(Clone)]
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build ledger client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Err(anyhow::anyhow!("{} {}: {}", what, status, text))
    }
}

#[async_trait]
impl SettlementLedger for HttpLedgerClient {
    async fn chain_info(&self) -> Result<ChainInfo> {
        let resp = self
            .client
            .get(self.url("/chain/info"))
            .send()
            .await
            .context("GET /chain/info failed")?;
        Self::check(resp, "GET /chain/info")
            .await?
            .json::<ChainInfo>()
            .await
            .context("Failed to parse chain info")
    }

    async fn poll_events(&self, from_height: u64) -> Result<EventPage> {
        let resp = self
            .client
            .get(self.url("/events"))
            .query(&[("from_height", from_height)])
            .send()
            .await
            .context("GET /events failed")?;
        Self::check(resp, "GET /events")
            .await?
            .json::<EventPage>()
            .await
            .context("Failed to parse event page")
    }

    async fn submit_report(&self, report: &SettlementReport) -> Result<SubmissionReceipt> {
        let resp = self
            .client
            .post(self.url("/reports"))
            .json(report)
            .send()
            .await
            .context("POST /reports failed")?;
        Self::check(resp, "POST /reports")
            .await?
            .json::<SubmissionReceipt>()
            .await
            .context("Failed to parse submission receipt")
    }
}
