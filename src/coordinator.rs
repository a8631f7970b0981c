//! Cycle Coordinator
//!
//! Runs one control-loop cycle end to end:
//! select strategy, build task, execute via the collector, classify,
//! self-heal within the retry budget, then commit metrics and the session
//! record exactly once.
//!
//! Every invocation that gets past the cycle gate yields a committed
//! [`SessionRecord`], including escalated cycles and cycles cut short by
//! the deadline.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::anomaly::{primary_kind, Anomaly, AnomalyDetector, RunAssessment, RunResult};
use crate::collector::Collector;
use crate::config::Config;
use crate::error::{AgentError, CollectorError};
use crate::healing::{HealingDecision, HealingState, HealingTrigger, SelfHealingController};
use crate::metrics::{CycleOutcome, MetricsStore, PerformanceState};
use crate::session_log::{CycleKind, Listing, ListingCounts, SessionLog, SessionRecord};
use crate::strategy::{Strategy, StrategyParams, StrategyPolicy, Task};

/// How the execute and heal phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Healthy,
    Escalated,
    Aborted,
}

/// Cycle-scoped state; survives a deadline abort so the record can
/// still be written
struct CycleProgress {
    controller: SelfHealingController,
    detector: AnomalyDetector,
    anomalies: Vec<Anomaly>,
    errors: usize,
    /// Last attempt's data and its assessment, if it produced any
    last: Option<(RunResult, RunAssessment)>,
}

/// Orchestrates cycles; at most one runs at a time
pub struct CycleCoordinator {
    config: Config,
    policy: StrategyPolicy,
    metrics: MetricsStore,
    log: Arc<SessionLog>,
    collector: Arc<dyn Collector>,
    gate: Mutex<()>,
}

impl CycleCoordinator {
    /// Build a coordinator, resuming metrics from the log if present
    pub fn new(
        config: Config,
        log: Arc<SessionLog>,
        collector: Arc<dyn Collector>,
    ) -> anyhow::Result<Self> {
        let metrics = match log.latest_metrics()? {
            Some(state) => {
                info!(
                    "Resuming from {} recorded runs (error rate {:.1}%)",
                    state.total_runs(),
                    state.error_rate * 100.0
                );
                MetricsStore::restore(state, config.metrics_window)
            }
            None => MetricsStore::new(config.metrics_window),
        };

        Ok(Self {
            policy: StrategyPolicy::new(config.policy_config()),
            config,
            metrics,
            log,
            collector,
            gate: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Last committed performance state
    pub fn performance(&self) -> PerformanceState {
        self.metrics.snapshot()
    }

    /// Most recent session records, newest first
    pub fn recent_sessions(&self, limit: usize) -> anyhow::Result<Vec<SessionRecord>> {
        self.log.recent(limit)
    }

    /// True while a cycle holds the gate
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Run one policy-driven cycle now
    pub async fn run_cycle(&self) -> Result<SessionRecord, AgentError> {
        let _gate = self.gate.try_lock().map_err(|_| AgentError::CycleInProgress)?;

        let state = self.metrics.snapshot();
        let decision = self.policy.decide(&state);
        info!(
            "Strategy {} selected by rule '{}' (error {:.1}%, quality {:.1}%, success {:.1}%)",
            decision.strategy,
            decision.rule,
            state.error_rate * 100.0,
            state.quality_score * 100.0,
            state.success_rate * 100.0
        );

        let task = Task::from_strategy(Uuid::new_v4(), decision.strategy, &self.config.strategies);
        self.execute(task, CycleKind::Scheduled, &state).await
    }

    /// Run an Aggressive-shaped cycle with the full sweep page budget,
    /// bypassing the policy
    pub async fn run_full_sweep(&self) -> Result<SessionRecord, AgentError> {
        let _gate = self.gate.try_lock().map_err(|_| AgentError::CycleInProgress)?;

        let state = self.metrics.snapshot();
        let base = self.config.strategies.params(Strategy::Aggressive);
        let params = StrategyParams {
            page_budget: self.config.full_sweep_pages,
            ..base
        };
        info!("Full sweep requested: {} pages", params.page_budget);

        let task = Task::new(Uuid::new_v4(), Strategy::Aggressive, params);
        self.execute(task, CycleKind::FullSweep, &state).await
    }

    async fn execute(
        &self,
        task: Task,
        kind: CycleKind,
        state: &PerformanceState,
    ) -> Result<SessionRecord, AgentError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let mut progress = CycleProgress {
            controller: SelfHealingController::new(self.config.healing_config()),
            detector: AnomalyDetector::new(self.config.detector_thresholds()),
            anomalies: Vec::new(),
            errors: 0,
            last: None,
        };

        let resolution = match tokio::time::timeout(
            self.config.cycle_deadline,
            self.collect(&task, state, &mut progress),
        )
        .await
        {
            Ok(resolution) => resolution,
            Err(_) => {
                error!(
                    "Cycle {} aborted after {:?} deadline",
                    task.cycle_id(),
                    self.config.cycle_deadline
                );
                Resolution::Aborted
            }
        };

        self.commit(task, kind, started_at, started.elapsed(), resolution, progress)
    }

    /// Attempt, classify and heal until healthy or escalated
    async fn collect(
        &self,
        task: &Task,
        state: &PerformanceState,
        progress: &mut CycleProgress,
    ) -> Resolution {
        loop {
            progress.controller.record_attempt();

            let trigger = match self.collector.fetch(task).await {
                Ok(result) if result.pages_succeeded == 0 && result.items.is_empty() => {
                    warn!(
                        "Attempt {} fetched no pages ({} attempted)",
                        progress.controller.attempts(),
                        result.pages_attempted
                    );
                    progress.errors += result.errors.len().max(1);
                    progress.last = None;
                    Self::empty_run_trigger(result, progress)
                }
                Ok(result) => {
                    progress.errors += result.errors.len();
                    let assessment = progress.detector.assess(&result);
                    let anomalies =
                        progress
                            .detector
                            .classify_assessed(&result, &assessment, state);
                    progress.anomalies.extend(anomalies.iter().cloned());
                    progress.last = Some((result, assessment));

                    if anomalies.is_empty() {
                        return Resolution::Healthy;
                    }
                    HealingTrigger::Anomalies(anomalies)
                }
                Err(e) if e.is_retryable() => {
                    warn!("Attempt {} failed: {}", progress.controller.attempts(), e);
                    progress.errors += 1;
                    progress.last = None;
                    HealingTrigger::TransientError(e)
                }
                Err(e) => {
                    warn!("Attempt {} failed: {}", progress.controller.attempts(), e);
                    progress.errors += 1;
                    progress.last = None;
                    let anomalies = AnomalyDetector::permanent_failure(&e);
                    progress.anomalies.extend(anomalies.iter().cloned());
                    HealingTrigger::Anomalies(anomalies)
                }
            };

            match progress
                .controller
                .handle(&trigger, &mut progress.detector)
            {
                HealingDecision::Retry { pause } => tokio::time::sleep(pause).await,
                HealingDecision::Escalate => return Resolution::Escalated,
            }
        }
    }

    /// A run that fetched nothing is a failed attempt. Only per-page errors
    /// that are all permanent skip the transient retry path.
    fn empty_run_trigger(result: RunResult, progress: &mut CycleProgress) -> HealingTrigger {
        let permanent = result.errors.iter().find(|e| !e.is_retryable()).cloned();
        match permanent {
            Some(e) if result.transient_errors() == 0 => {
                let anomalies = AnomalyDetector::permanent_failure(&e);
                progress.anomalies.extend(anomalies.iter().cloned());
                HealingTrigger::Anomalies(anomalies)
            }
            _ => HealingTrigger::TransientError(
                result
                    .errors
                    .into_iter()
                    .find(CollectorError::is_retryable)
                    .unwrap_or_else(|| {
                        CollectorError::Transient("collector returned no pages".into())
                    }),
            ),
        }
    }

    /// Write listings, metrics and the session record in one step
    fn commit(
        &self,
        task: Task,
        kind: CycleKind,
        started_at: chrono::DateTime<Utc>,
        elapsed: Duration,
        resolution: Resolution,
        progress: CycleProgress,
    ) -> Result<SessionRecord, AgentError> {
        let success = resolution == Resolution::Healthy;
        let report = progress.controller.report();

        let mut outcome = match &progress.last {
            Some((result, assessment)) => {
                CycleOutcome::from_run(result, assessment.quality, success, report.entered)
            }
            None => CycleOutcome::failed(progress.errors, elapsed, report.entered),
        };
        outcome.errors = progress.errors;
        outcome.duration = elapsed;

        let listings: Vec<Listing<'_>> = match &progress.last {
            Some((result, assessment)) => result
                .items
                .iter()
                .zip(&assessment.checks)
                .map(|(item, check)| Listing {
                    item,
                    completeness_pct: check.completeness_pct,
                })
                .collect(),
            None => Vec::new(),
        };

        let mut record = SessionRecord {
            cycle_id: task.cycle_id(),
            kind,
            started_at,
            ended_at: outcome.finished_at,
            strategy: task.strategy(),
            pages: outcome.pages,
            items: outcome.items,
            errors: outcome.errors,
            anomalies: progress.anomalies,
            actions: report.actions,
            healing_state: report.final_state,
            new_listings: 0,
            updated_listings: 0,
            aborted: resolution == Resolution::Aborted,
            success,
        };

        let log = &self.log;
        let mut counts = ListingCounts::default();
        self.metrics.commit(&outcome, |next| {
            counts = log.commit(&record, &listings, next)?;
            Ok(())
        })?;
        record.new_listings = counts.new;
        record.updated_listings = counts.updated;

        match resolution {
            Resolution::Healthy if record.healing_state == HealingState::Resumed => info!(
                "Cycle {} recovered after {} attempts: {} items from {} pages",
                record.cycle_id, report.attempts, record.items, record.pages
            ),
            Resolution::Healthy => info!(
                "Cycle {} completed: {} items from {} pages in {:.1}s ({} new listings)",
                record.cycle_id,
                record.items,
                record.pages,
                elapsed.as_secs_f64(),
                record.new_listings
            ),
            Resolution::Escalated => error!(
                "Cycle {} escalated ({}): {} anomalies, {} errors",
                record.cycle_id,
                primary_kind(&record.anomalies),
                record.anomalies.len(),
                record.errors
            ),
            Resolution::Aborted => warn!(
                "Cycle {} recorded as aborted with {} items",
                record.cycle_id, record.items
            ),
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::tests::good_item;
    use crate::error::CollectorError;
    use crate::strategy::StrategyTable;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back scripted outcomes, then repeats the last one
    struct ScriptedCollector {
        script: parking_lot::Mutex<VecDeque<Result<RunResult, CollectorError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedCollector {
        fn new(script: Vec<Result<RunResult, CollectorError>>) -> Arc<Self> {
            Arc::new(Self {
                script: parking_lot::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Collector for ScriptedCollector {
        async fn fetch(&self, _task: &Task) -> Result<RunResult, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or_else(|| Ok(RunResult::default()))
            } else {
                script.front().cloned().unwrap_or_else(|| Ok(RunResult::default()))
            }
        }
    }

    fn healthy_run() -> RunResult {
        RunResult {
            pages_attempted: 1,
            pages_succeeded: 1,
            items: (0..12).map(good_item).collect(),
            errors: Vec::new(),
            duration: Duration::from_secs(1),
        }
    }

    fn test_config() -> Config {
        Config {
            heal_pause: Duration::ZERO,
            strategies: StrategyTable::default(),
            ..Config::default()
        }
    }

    fn coordinator(collector: Arc<ScriptedCollector>) -> CycleCoordinator {
        let log = Arc::new(SessionLog::open_in_memory().unwrap());
        CycleCoordinator::new(test_config(), log, collector).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_cycle() {
        let collector = ScriptedCollector::new(vec![Ok(healthy_run())]);
        let coordinator = coordinator(collector.clone());

        let record = coordinator.run_cycle().await.unwrap();

        assert!(record.success);
        assert_eq!(record.strategy, Strategy::Minimal);
        assert_eq!(record.healing_state, HealingState::Idle);
        assert!(record.anomalies.is_empty());
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.performance().self_heals, 0);
    }

    #[tokio::test]
    async fn test_transient_errors_escalate() {
        let collector =
            ScriptedCollector::new(vec![Err(CollectorError::Transient("timeout".into()))]);
        let coordinator = coordinator(collector.clone());

        let record = coordinator.run_cycle().await.unwrap();

        assert!(!record.success);
        assert_eq!(record.healing_state, HealingState::Escalated);
        assert_eq!(record.errors, 3);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.performance().self_heals, 1);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let collector = ScriptedCollector::new(vec![
            Err(CollectorError::Transient("connection reset".into())),
            Ok(healthy_run()),
        ]);
        let coordinator = coordinator(collector.clone());

        let record = coordinator.run_cycle().await.unwrap();

        assert!(record.success);
        assert_eq!(record.healing_state, HealingState::Resumed);
        assert_eq!(record.items, 12);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.performance().self_heals, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_recorded_as_anomaly() {
        let collector =
            ScriptedCollector::new(vec![Err(CollectorError::Permanent("bad schema".into()))]);
        let coordinator = coordinator(collector);

        let record = coordinator.run_cycle().await.unwrap();

        assert!(!record.success);
        assert!(record
            .anomalies
            .iter()
            .any(|a| a.kind == crate::anomaly::AnomalyKind::MissingFields));
    }

    #[tokio::test]
    async fn test_full_sweep_uses_extended_budget() {
        let collector = ScriptedCollector::new(vec![Ok(healthy_run())]);
        let coordinator = coordinator(collector);

        let record = coordinator.run_full_sweep().await.unwrap();

        assert_eq!(record.kind, CycleKind::FullSweep);
        assert_eq!(record.strategy, Strategy::Aggressive);
    }

    #[tokio::test]
    async fn test_empty_result_is_a_failed_attempt() {
        let collector = ScriptedCollector::new(vec![Ok(RunResult::default())]);
        let coordinator = coordinator(collector.clone());

        let record = coordinator.run_cycle().await.unwrap();

        assert!(!record.success);
        assert_eq!(record.healing_state, HealingState::Escalated);
        assert_eq!(record.pages, 0);
        assert_eq!(record.errors, 3);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.performance().failed_runs, 1);
    }

    #[tokio::test]
    async fn test_all_pages_rejected_heals_as_permanent() {
        let rejected = RunResult {
            pages_attempted: 2,
            errors: vec![
                CollectorError::Permanent("HTTP 404 Not Found".into()),
                CollectorError::Permanent("HTTP 404 Not Found".into()),
            ],
            ..RunResult::default()
        };
        let collector = ScriptedCollector::new(vec![Ok(rejected)]);
        let coordinator = coordinator(collector);

        let record = coordinator.run_cycle().await.unwrap();

        assert!(!record.success);
        assert_eq!(record.errors, 6);
        assert!(record
            .anomalies
            .iter()
            .any(|a| a.kind == crate::anomaly::AnomalyKind::MissingFields));
    }

    #[tokio::test]
    async fn test_listings_are_stored_with_the_session() {
        let collector = ScriptedCollector::new(vec![Ok(healthy_run())]);
        let log = Arc::new(SessionLog::open_in_memory().unwrap());
        let coordinator =
            CycleCoordinator::new(test_config(), Arc::clone(&log), collector).unwrap();

        let first = coordinator.run_cycle().await.unwrap();
        let second = coordinator.run_cycle().await.unwrap();

        assert_eq!((first.new_listings, first.updated_listings), (12, 0));
        assert_eq!((second.new_listings, second.updated_listings), (0, 12));
        assert_eq!(log.listing_count().unwrap(), 12);

        let stored = log.listing("3").unwrap().unwrap();
        assert_eq!(stored.completeness_pct, 100.0);
        assert_eq!(stored.cycle_id, second.cycle_id);
    }
}
