//! Service configuration
//!
//! Process flags come from the command line (or env), tunables from an
//! optional TOML file, and secrets only from the environment.

use crate::ingest::auth::{strict_secret_problem, DEFAULT_WINDOW_SECS, PRODUCTION_WINDOW_SECS};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "rainwatch")]
#[command(about = "Parametric rainfall monitoring service")]
pub struct Args {
    /// TOML config file (defaults apply when absent)
    #[arg(long, env = "RAINWATCH_CONFIG", default_value = "rainwatch.toml")]
    pub config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(long, env = "RAINWATCH_BIND")]
    pub bind: Option<String>,

    /// SQLite database path, overrides the config file
    #[arg(long, env = "RAINWATCH_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Strict mode: enforce secret rules and the short auth window
    #[arg(long, env = "RAINWATCH_PRODUCTION")]
    pub production: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("rainwatch.db")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    crate::scheduler::DEFAULT_INTERVAL_SECS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    /// Seconds the admin health probe waits for the ledger.
    #[serde(default = "default_probe_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_tolerance")]
    pub restart_tolerance_blocks: u64,
}

fn default_ledger_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_poll_secs() -> u64 {
    15
}

fn default_probe_secs() -> u64 {
    3
}

fn default_tolerance() -> u64 {
    crate::scheduler::restart::HEIGHT_REGRESSION_TOLERANCE
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: default_ledger_url(),
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_secs(),
            probe_timeout_secs: default_probe_secs(),
            restart_tolerance_blocks: default_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_weather_url() -> String {
    crate::upstream::weather::DEFAULT_WEATHER_BASE.to_string()
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_weather_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Disables all ingest auth checks. Never allowed in production.
    #[serde(default)]
    pub dev_mode: bool,
    /// Accepted clock skew; defaults to 300s, or 120s in production.
    #[serde(default)]
    pub window_secs: Option<i64>,
    #[serde(default = "default_nonce_threshold")]
    pub nonce_prune_threshold: usize,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_observation_days")]
    pub observation_retention_days: i64,
    #[serde(default = "default_snapshot_days")]
    pub snapshot_retention_days: i64,
}

fn default_nonce_threshold() -> usize {
    crate::ingest::nonce::DEFAULT_PRUNE_THRESHOLD
}

fn default_rate_limit() -> u32 {
    120
}

fn default_observation_days() -> i64 {
    crate::ingest::gateway::DEFAULT_OBSERVATION_RETENTION_DAYS
}

fn default_snapshot_days() -> i64 {
    crate::ingest::gateway::DEFAULT_SNAPSHOT_RETENTION_DAYS
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            window_secs: None,
            nonce_prune_threshold: default_nonce_threshold(),
            rate_limit_per_minute: default_rate_limit(),
            observation_retention_days: default_observation_days(),
            snapshot_retention_days: default_snapshot_days(),
        }
    }
}

impl IngestConfig {
    pub fn effective_window_secs(&self, production: bool) -> i64 {
        self.window_secs.unwrap_or(if production {
            PRODUCTION_WINDOW_SECS
        } else {
            DEFAULT_WINDOW_SECS
        })
    }
}

/// Secrets, read from the environment only.
#[derive(Clone, Default)]
pub struct Secrets {
    pub ingest_secret: String,
    pub reporter_secret: String,
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("ingest_secret", &"<redacted>")
            .field("reporter_secret", &"<redacted>")
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            ingest_secret: std::env::var("INGEST_SECRET").unwrap_or_default(),
            reporter_secret: std::env::var("REPORTER_SECRET").unwrap_or_default(),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))
    }

    /// Load `path` if it exists, otherwise defaults. A file that exists but
    /// does not parse is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("Config {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.server.bind = bind.clone();
        }
        if let Some(db_path) = &args.db_path {
            self.server.db_path = db_path.clone();
        }
    }

    /// Reject unusable settings. `strict` adds the production secret rules.
    pub fn validate(&self, secrets: &Secrets, strict: bool) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be positive");
        }
        if self.ledger.timeout_secs == 0 || self.weather.timeout_secs == 0 {
            bail!("upstream timeouts must be positive");
        }
        if self.ledger.poll_interval_secs == 0 {
            bail!("ledger.poll_interval_secs must be positive");
        }
        if self.ingest.effective_window_secs(strict) <= 0 {
            bail!("ingest.window_secs must be positive");
        }
        if self.ingest.rate_limit_per_minute == 0 {
            bail!("ingest.rate_limit_per_minute must be positive");
        }
        if self.ingest.observation_retention_days <= 0 || self.ingest.snapshot_retention_days <= 0
        {
            bail!("retention periods must be positive");
        }

        if strict {
            if self.ingest.dev_mode {
                bail!("ingest.dev_mode is not allowed in production");
            }
            if let Some(problem) = strict_secret_problem(&secrets.ingest_secret) {
                bail!("INGEST_SECRET: {}", problem);
            }
            if secrets.reporter_secret.len() < crate::ingest::auth::MIN_STRICT_SECRET_LEN {
                bail!("REPORTER_SECRET must be set and at least 32 characters in production");
            }
            if secrets.admin_token.is_none() {
                bail!("ADMIN_TOKEN must be set in production");
            }
        } else {
            if !self.ingest.dev_mode && secrets.ingest_secret.is_empty() {
                bail!("INGEST_SECRET must be set unless ingest.dev_mode is enabled");
            }
            if secrets.reporter_secret.is_empty() {
                warn!("REPORTER_SECRET is empty; settlement reports are effectively unsigned");
            }
        }
        Ok(())
    }
}
