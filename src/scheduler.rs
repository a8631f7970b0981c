//! Cycle Scheduler
//!
//! Triggers cycles on a fixed interval (first one immediately) or on
//! demand. Cycles never overlap: a trigger that lands while a cycle is
//! still running is skipped, not queued. Shutdown takes effect between
//! cycles, so an in-flight cycle always reaches its commit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::CycleCoordinator;
use crate::error::AgentError;
use crate::report;
use crate::session_log::SessionRecord;

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub struct CycleScheduler {
    coordinator: Arc<CycleCoordinator>,
    period: Duration,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl CycleScheduler {
    pub fn new(coordinator: Arc<CycleCoordinator>, period: Duration) -> Self {
        Self {
            coordinator,
            period,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Run one cycle now
    pub async fn trigger(&self) -> Option<SessionRecord> {
        match self.coordinator.run_cycle().await {
            Ok(record) => {
                if record.success {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                info!("{}", report::format_performance(&self.coordinator.performance()));
                Some(record)
            }
            Err(AgentError::CycleInProgress) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                warn!("Trigger skipped: previous cycle still running");
                None
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Cycle failed to commit: {}", e);
                None
            }
        }
    }

    /// Run cycles every `period` until `shutdown` flips to true
    pub async fn run_continuous(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("Scheduler started: one cycle every {:?}", self.period);

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Scheduled trigger");
                    self.trigger().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            "Scheduler stopped: {} completed, {} failed, {} skipped",
            stats.completed, stats.failed, stats.skipped
        );
    }
}
