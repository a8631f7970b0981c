//! Performance Metrics
//!
//! Rolling performance state read by the strategy policy and replaced once
//! per committed cycle. Counters only ever grow; the rates and the quality
//! score are recomputed from a count-based trailing window of the most
//! recent cycles, so the window never grows past its configured bound.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::anomaly::RunResult;

/// Default trailing window (cycles)
pub const DEFAULT_WINDOW: usize = 20;

/// One cycle's contribution to the rolling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSample {
    pub success: bool,
    /// Run quality, 0-1
    pub quality: f64,
    pub duration_secs: f64,
    pub at: DateTime<Utc>,
}

/// What a finished cycle hands to the store
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub pages: u32,
    pub items: usize,
    pub errors: usize,
    pub quality: f64,
    pub duration: Duration,
    pub success: bool,
    /// The cycle entered self-healing at least once
    pub healed: bool,
    pub finished_at: DateTime<Utc>,
}

impl CycleOutcome {
    /// Summarize a classified run
    pub fn from_run(result: &RunResult, quality: f64, success: bool, healed: bool) -> Self {
        Self {
            pages: result.pages_succeeded,
            items: result.items.len(),
            errors: result.errors.len(),
            quality,
            duration: result.duration,
            success,
            healed,
            finished_at: Utc::now(),
        }
    }

    /// A cycle that produced no data at all
    pub fn failed(errors: usize, duration: Duration, healed: bool) -> Self {
        Self {
            pages: 0,
            items: 0,
            errors,
            quality: 0.0,
            duration,
            success: false,
            healed,
            finished_at: Utc::now(),
        }
    }
}

/// Rolling, process-wide summary of historical outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceState {
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub total_pages: u64,
    pub total_items: u64,
    pub total_errors: u64,
    pub self_heals: u64,
    /// Failed / total over the window
    pub error_rate: f64,
    /// Successful / total over the window
    pub success_rate: f64,
    /// Mean run quality over the window
    pub quality_score: f64,
    pub avg_duration_secs: f64,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window: VecDeque<RunSample>,
}

impl PerformanceState {
    pub fn total_runs(&self) -> u64 {
        self.successful_runs + self.failed_runs
    }

    /// Pure update: previous state + one outcome -> next state
    pub fn updated(&self, outcome: &CycleOutcome, window_size: usize) -> Self {
        let mut next = self.clone();

        if outcome.success {
            next.successful_runs += 1;
        } else {
            next.failed_runs += 1;
        }
        next.total_pages += outcome.pages as u64;
        next.total_items += outcome.items as u64;
        next.total_errors += outcome.errors as u64;
        if outcome.healed {
            next.self_heals += 1;
        }
        next.last_run_at = Some(outcome.finished_at);

        next.window.push_back(RunSample {
            success: outcome.success,
            quality: outcome.quality.clamp(0.0, 1.0),
            duration_secs: outcome.duration.as_secs_f64(),
            at: outcome.finished_at,
        });
        next.trim_window(window_size);
        next.recompute();
        next
    }

    /// Drop the oldest samples beyond the bound and refresh the rates
    pub fn trim_window(&mut self, window_size: usize) {
        let bound = window_size.max(1);
        while self.window.len() > bound {
            self.window.pop_front();
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let n = self.window.len();
        if n == 0 {
            self.error_rate = 0.0;
            self.success_rate = 0.0;
            self.quality_score = 0.0;
            self.avg_duration_secs = 0.0;
            return;
        }

        let n_f = n as f64;
        let successes = self.window.iter().filter(|s| s.success).count() as f64;
        self.success_rate = successes / n_f;
        self.error_rate = (n_f - successes) / n_f;
        self.quality_score = self.window.iter().map(|s| s.quality).sum::<f64>() / n_f;
        self.avg_duration_secs = self.window.iter().map(|s| s.duration_secs).sum::<f64>() / n_f;
    }
}

/// Single-writer holder of the performance state
pub struct MetricsStore {
    state: RwLock<PerformanceState>,
    window_size: usize,
}

impl MetricsStore {
    pub fn new(window_size: usize) -> Self {
        Self::restore(PerformanceState::default(), window_size)
    }

    /// Resume from a previously committed state
    pub fn restore(mut state: PerformanceState, window_size: usize) -> Self {
        state.trim_window(window_size);
        debug!(
            "Metrics restored: {} runs, window {}/{}",
            state.total_runs(),
            state.window.len(),
            window_size
        );
        Self {
            state: RwLock::new(state),
            window_size,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Consistent copy of the last committed state
    pub fn snapshot(&self) -> PerformanceState {
        self.state.read().clone()
    }

    pub fn error_rate(&self) -> f64 {
        self.state.read().error_rate
    }

    /// Apply one outcome atomically.
    ///
    /// The write lock is held while `persist` runs, so no reader sees the
    /// new state before it is durable, and a failed persist leaves the
    /// previous state in place.
    pub fn commit<F>(&self, outcome: &CycleOutcome, persist: F) -> Result<PerformanceState>
    where
        F: FnOnce(&PerformanceState) -> Result<()>,
    {
        let mut guard = self.state.write();
        let next = guard.updated(outcome, self.window_size);
        persist(&next)?;
        *guard = next.clone();

        info!(
            "Metrics committed: runs={} error_rate={:.1}% quality={:.1}% heals={}",
            next.total_runs(),
            next.error_rate * 100.0,
            next.quality_score * 100.0,
            next.self_heals
        );
        Ok(next)
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
