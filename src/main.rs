//! Rainwatch - parametric rainfall cover monitor
//!
//! Watches the settlement ledger for new covers, follows each cover's
//! location through hourly rainfall buckets and reports the outcome back to
//! the ledger once the cover triggers or matures.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rainwatch_backend::{
    api::{create_router, AppServices},
    config::{AppConfig, Args, Secrets},
    health::Subsystem,
    ingest::{IngestAuthenticator, IngestGateway},
    middleware::{AdminToken, RateLimitConfig, RateLimiter},
    monitor::{MonitorEngine, ReportSigner},
    scheduler::{
        restart::{RestartGapDetector, RestartVerdict},
        system_clock, Clock, IntervalTicker, SchedulerLoop,
    },
    storage::SqliteStore,
    upstream::{HttpLedgerClient, OpenMeteoClient, SettlementLedger},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config)?;
    config.apply_args(&args);
    let secrets = Secrets::from_env();
    config
        .validate(&secrets, args.production)
        .context("Invalid configuration")?;

    info!("🌧️  Rainwatch starting");
    info!(
        production = args.production,
        bind = %config.server.bind,
        db = %config.server.db_path.display(),
        "Configuration loaded"
    );
    if config.ingest.dev_mode {
        warn!("⚠️  Ingest dev mode is ON: signatures, timestamps and nonces are NOT checked");
    }
    if secrets.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set; /admin routes are unauthenticated");
    }

    let store = Arc::new(
        SqliteStore::open(&config.server.db_path)
            .with_context(|| format!("open database {}", config.server.db_path.display()))?,
    );
    let clock = system_clock();

    let weather = Arc::new(OpenMeteoClient::new(
        config.weather.base_url.clone(),
        Duration::from_secs(config.weather.timeout_secs),
    )?);
    let ledger: Arc<dyn SettlementLedger> = Arc::new(HttpLedgerClient::new(
        config.ledger.base_url.clone(),
        Duration::from_secs(config.ledger.timeout_secs),
    )?);

    let window_secs = config.ingest.effective_window_secs(args.production);
    let auth = IngestAuthenticator::new(
        secrets.ingest_secret.clone(),
        window_secs,
        config.ingest.nonce_prune_threshold,
    )
    .dev_mode(config.ingest.dev_mode);
    info!(window_secs, "Ingest authentication configured");

    let state = AppServices {
        store: store.clone(),
        weather,
        ledger: ledger.clone(),
        signer: ReportSigner::new(secrets.reporter_secret.clone()),
        auth,
        clock: clock.clone(),
        retention_days: (
            config.ingest.observation_retention_days,
            config.ingest.snapshot_retention_days,
        ),
        ledger_probe_timeout: Duration::from_secs(config.ledger.probe_timeout_secs),
    }
    .into_state();

    // Monitor evaluation cycle
    let scheduler = SchedulerLoop::new(
        state.engine.clone(),
        Box::new(IntervalTicker::new(Duration::from_secs(
            config.scheduler.interval_secs,
        ))),
        clock.clone(),
    )
    .spawn();
    info!(
        interval_secs = config.scheduler.interval_secs,
        "Scheduler started"
    );

    // Ledger lifecycle events, with restart detection on every (re)connect
    let detector = RestartGapDetector::new(store.clone())
        .with_tolerance(config.ledger.restart_tolerance_blocks);
    tokio::spawn(ledger_event_polling(
        state.engine.clone(),
        ledger,
        detector,
        clock.clone(),
        Duration::from_secs(config.ledger.poll_interval_secs),
    ));

    // Ingest retention
    tokio::spawn(ingest_pruning_polling(state.gateway.clone(), clock.clone()));

    let limiter = RateLimiter::new(RateLimitConfig::per_minute(
        config.ingest.rate_limit_per_minute,
    ));
    tokio::spawn(rate_limit_cleanup(limiter.clone()));

    let app = create_router(state, limiter, AdminToken::new(secrets.admin_token.clone()));

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("🚀 Listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    scheduler.stop().await;
    info!("Rainwatch stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rainwatch_backend=debug,rainwatch=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate root when launched from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Polls ledger events, running restart detection on each (re)connect. A
/// continuous chain resumes from the persisted cursor; a new or restarted
/// chain is replayed from height 0.
async fn ledger_event_polling(
    engine: Arc<MonitorEngine>,
    ledger: Arc<dyn SettlementLedger>,
    detector: RestartGapDetector,
    clock: Clock,
    period: Duration,
) {
    let health = engine.health().clone();
    let mut ticker = interval(period);
    let mut cursor: Option<u64> = None;

    loop {
        ticker.tick().await;
        let now = clock();

        let from = match cursor {
            Some(next) => next,
            None => match detector.check_ledger(ledger.as_ref()).await {
                Ok(verdict) => {
                    health.record_success(Subsystem::Ledger, now);
                    match &verdict {
                        RestartVerdict::Reset { reason, cleared } => warn!(
                            ?reason,
                            monitors = cleared.monitors,
                            "Ledger restart detected, monitoring data cleared"
                        ),
                        other => info!(verdict = ?other, "Ledger connected"),
                    }
                    match detector.resume_height(&verdict) {
                        Ok(from) => from,
                        Err(e) => {
                            warn!("Failed to read ledger event cursor: {:#}", e);
                            continue;
                        }
                    }
                }
                Err(e) => {
                    health.record_failure(Subsystem::Ledger, now, format!("{:#}", e));
                    warn!("Ledger unreachable: {:#}", e);
                    continue;
                }
            },
        };

        let page = match ledger.poll_events(from).await {
            Ok(page) => page,
            Err(e) => {
                health.record_failure(Subsystem::Ledger, now, format!("{:#}", e));
                warn!("Ledger event poll failed: {:#}", e);
                // Re-run restart detection once the ledger is back
                cursor = None;
                continue;
            }
        };
        health.record_success(Subsystem::Ledger, now);

        if !page.events.is_empty() {
            debug!(from, count = page.events.len(), height = page.height, "Ledger events");
        }
        for envelope in page.events {
            if let Err(e) = engine.handle_event(envelope.event, now).await {
                warn!(height = envelope.height, "Ledger event not applied: {:#}", e);
            }
        }

        if let Err(e) = detector.record_height(page.height) {
            warn!("Failed to record ledger height: {:#}", e);
        }
        let next = from.max(page.height + 1);
        if let Err(e) = detector.save_cursor(next) {
            warn!("Failed to save ledger event cursor: {:#}", e);
        }
        cursor = Some(next);
    }
}

/// Drops ingest rows past their retention period, hourly.
async fn ingest_pruning_polling(gateway: Arc<IngestGateway>, clock: Clock) {
    let mut ticker = interval(Duration::from_secs(3_600));
    loop {
        ticker.tick().await;
        match gateway.prune_expired(clock()) {
            Ok((observations, snapshots)) => {
                if observations + snapshots > 0 {
                    info!(
                        "🧹 Pruned {} observations, {} snapshots",
                        observations, snapshots
                    );
                }
            }
            Err(e) => warn!("Ingest pruning failed: {:#}", e),
        }
    }
}

async fn rate_limit_cleanup(limiter: RateLimiter) {
    let mut ticker = interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let removed = limiter.cleanup();
        if removed > 0 {
            debug!(removed, "Rate limiter entries expired");
        }
    }
}
