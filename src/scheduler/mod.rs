//! Periodic evaluation scheduling
//!
//! The loop is driven by an injected [`Ticker`] so tests can advance it by hand.
//! Lifecycle is explicit: [`SchedulerLoop::spawn`] returns a handle whose
//! `stop()` ends the loop and waits for the in-flight cycle to finish.

pub mod restart;

pub use restart::{ResetReason, RestartGapDetector, RestartVerdict};

use crate::monitor::{CycleSummary, MonitorEngine};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info};

pub const DEFAULT_INTERVAL_SECS: u64 = 1_800;

/// Source of "now" as unix seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

#[async_trait]
pub trait Ticker: Send {
    /// Resolves at the next tick; `None` once the ticker can never fire again.
    async fn tick(&mut self) -> Option<()>;
}

/// Fires immediately, then every `period`.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> Option<()> {
        self.interval.tick().await;
        Some(())
    }
}

/// Fires only when its [`ManualTrigger`] is pulled.
pub struct ManualTicker {
    rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct ManualTrigger {
    tx: mpsc::Sender<()>,
}

impl ManualTrigger {
    pub async fn fire(&self) -> bool {
        self.tx.send(()).await.is_ok()
    }
}

impl ManualTicker {
    pub fn channel() -> (Self, ManualTrigger) {
        let (tx, rx) = mpsc::channel(16);
        (Self { rx }, ManualTrigger { tx })
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

pub struct SchedulerLoop {
    engine: Arc<MonitorEngine>,
    ticker: Box<dyn Ticker>,
    clock: Clock,
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    completed: watch::Receiver<Option<CycleSummary>>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Most recent finished cycle, updated after every tick.
    pub fn completed(&self) -> watch::Receiver<Option<CycleSummary>> {
        self.completed.clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
    }
}

impl SchedulerLoop {
    pub fn new(engine: Arc<MonitorEngine>, ticker: Box<dyn Ticker>, clock: Clock) -> Self {
        Self {
            engine,
            ticker,
            clock,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (completed_tx, completed_rx) = watch::channel(None);
        let join = tokio::spawn(self.run(shutdown_rx, completed_tx));
        SchedulerHandle {
            shutdown: shutdown_tx,
            completed: completed_rx,
            join,
        }
    }

    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        completed: watch::Sender<Option<CycleSummary>>,
    ) {
        info!("Scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                tick = self.ticker.tick() => {
                    if tick.is_none() {
                        break;
                    }
                    let now = (self.clock)();
                    match self.engine.run_cycle(now).await {
                        Ok(summary) => {
                            let _ = completed.send(Some(summary));
                        }
                        // Health is marked offline inside run_cycle.
                        Err(e) => error!("Scheduler cycle failed: {:#}", e),
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}
