//! Weather provider client
//!
//! Only the trailing 24h of hourly precipitation is ever requested; anything
//! older is reconstructed by backfill.

use crate::models::{hour_floor, BUCKET_SECS, ROLLING_WINDOW_SECS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_WEATHER_BASE: &str = "https://api.open-meteo.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyReading {
    pub hour_start: i64,
    pub rainfall_tenths_mm: u32,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Completed hours back to the one containing `now - 24h`, ascending.
    async fn last_24_hours(&self, lat: f64, lon: f64, now: i64) -> Result<Vec<HourlyReading>>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    hourly: HourlySeries,
}

#[derive(Debug, Deserialize)]
struct HourlySeries {
    time: Vec<i64>,
    precipitation: Vec<Option<f64>>,
}

#[derive(Clone)]
pub struct OpenMeteoClient {
    client: Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build weather client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

/// Provider timestamps mark the *end* of the accumulation hour.
fn readings_from(series: HourlySeries, now: i64) -> Vec<HourlyReading> {
    let window_start = hour_floor(now - ROLLING_WINDOW_SECS);
    let mut out: Vec<HourlyReading> = series
        .time
        .into_iter()
        .zip(series.precipitation)
        .filter_map(|(hour_end, mm)| {
            let mm = mm?;
            let hour_start = hour_end - BUCKET_SECS;
            if hour_start < window_start || hour_end > now {
                return None;
            }
            Some(HourlyReading {
                hour_start,
                rainfall_tenths_mm: mm_to_tenths(mm),
            })
        })
        .collect();
    out.sort_by_key(|r| r.hour_start);
    out.dedup_by_key(|r| r.hour_start);
    out
}

pub fn mm_to_tenths(mm: f64) -> u32 {
    if !mm.is_finite() || mm <= 0.0 {
        return 0;
    }
    (mm * 10.0).round().min(u32::MAX as f64) as u32
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    async fn last_24_hours(&self, lat: f64, lon: f64, now: i64) -> Result<Vec<HourlyReading>> {
        let url = format!("{}/v1/forecast", self.base_url);
        let qp = [
            ("latitude", format!("{:.4}", lat)),
            ("longitude", format!("{:.4}", lon)),
            ("hourly", "precipitation".to_string()),
            ("past_days", "1".to_string()),
            ("forecast_days", "1".to_string()),
            ("timeformat", "unixtime".to_string()),
            ("timezone", "GMT".to_string()),
        ];

        let resp = self
            .client
            .get(url)
            .query(&qp)
            .send()
            .await
            .context("GET /v1/forecast failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET /v1/forecast {}: {}", status, text));
        }

        let body = resp
            .json::<ForecastResponse>()
            .await
            .context("Failed to parse forecast response")?;

        Ok(readings_from(body.hourly, now))
    }
}
