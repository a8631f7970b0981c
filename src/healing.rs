//! Self-Healing Controller
//!
//! Per-cycle state machine entered when a run is anomalous or the collector
//! fails transiently:
//!
//! ```text
//! Idle -> Detected -> Logged -> Paused -> [Diagnosing -> [Adjusting]] -> Resumed
//!                        \
//!                         +-> Escalated (retry budget exhausted)
//! ```
//!
//! The controller only decides; the coordinator performs the pause and the
//! retry. A retry that is still anomalous re-enters `Detected` from
//! `Resumed`. Every collector attempt counts against `max_retries`, so the
//! loop always terminates in `Resumed` or `Escalated`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::anomaly::{Anomaly, AnomalyDetector, AnomalyKind};
use crate::error::CollectorError;

/// Healing states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealingState {
    Idle,
    Detected,
    Logged,
    Paused,
    Diagnosing,
    Adjusting,
    /// Terminal: retrying or resolved
    Resumed,
    /// Terminal: budget exhausted without resolution
    Escalated,
}

impl HealingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resumed | Self::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Detected => "detected",
            Self::Logged => "logged",
            Self::Paused => "paused",
            Self::Diagnosing => "diagnosing",
            Self::Adjusting => "adjusting",
            Self::Resumed => "resumed",
            Self::Escalated => "escalated",
        }
    }
}

impl FromStr for HealingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "detected" => Ok(Self::Detected),
            "logged" => Ok(Self::Logged),
            "paused" => Ok(Self::Paused),
            "diagnosing" => Ok(Self::Diagnosing),
            "adjusting" => Ok(Self::Adjusting),
            "resumed" => Ok(Self::Resumed),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown healing state '{}'", other)),
        }
    }
}

/// Corrective steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealingAction {
    LogOnly,
    Pause,
    Diagnose,
    AdjustThreshold,
    Escalate,
}

impl HealingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogOnly => "log_only",
            Self::Pause => "pause",
            Self::Diagnose => "diagnose",
            Self::AdjustThreshold => "adjust_threshold",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for HealingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action together with what it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAction {
    pub action: HealingAction,
    pub detail: String,
}

/// Why healing was entered
#[derive(Debug, Clone)]
pub enum HealingTrigger {
    Anomalies(Vec<Anomaly>),
    TransientError(CollectorError),
}

impl HealingTrigger {
    fn is_structural(&self) -> bool {
        match self {
            Self::Anomalies(anomalies) => anomalies.iter().any(|a| a.kind.is_structural()),
            Self::TransientError(_) => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Anomalies(anomalies) => anomalies
                .iter()
                .map(|a| format!("{} ({})", a.kind, a.detail))
                .collect::<Vec<_>>()
                .join("; "),
            Self::TransientError(e) => e.to_string(),
        }
    }
}

/// What the coordinator should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingDecision {
    /// Wait, then retry the task
    Retry { pause: Duration },
    /// Stop; the cycle is unresolved
    Escalate,
}

/// Healing configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HealingConfig {
    /// Collector attempts per cycle, first attempt included
    pub max_retries: u32,
    /// Pause before the first retry
    pub pause: Duration,
    /// Upper bound on any pause
    pub max_pause: Duration,
    /// Multiplier applied per additional retry
    pub backoff_multiplier: f64,
    /// Lowest fraction of `min_items_per_page` a recalibration may go to
    pub min_items_floor_ratio: f64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            pause: Duration::from_secs(5),
            max_pause: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            min_items_floor_ratio: 0.5,
        }
    }
}

impl HealingConfig {
    /// Pause before retry number `retry` (1-based), capped at `max_pause`
    pub fn pause_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        if exponent == 0 {
            return self.pause.min(self.max_pause);
        }

        // Cap in f64 first; the raw product overflows Duration for large retries
        let secs = (self.pause.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_pause.as_secs_f64());
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_pause)
            .min(self.max_pause)
    }
}

/// Summary handed to the session record
#[derive(Debug, Clone, PartialEq)]
pub struct HealingReport {
    pub final_state: HealingState,
    pub entered: bool,
    pub attempts: u32,
    pub actions: Vec<AppliedAction>,
}

/// Per-cycle self-healing state machine
pub struct SelfHealingController {
    config: HealingConfig,
    state: HealingState,
    attempts: u32,
    entered: bool,
    actions: Vec<AppliedAction>,
    history: Vec<HealingState>,
}

impl SelfHealingController {
    pub fn new(config: HealingConfig) -> Self {
        Self {
            config,
            state: HealingState::Idle,
            attempts: 0,
            entered: false,
            actions: Vec::new(),
            history: vec![HealingState::Idle],
        }
    }

    pub fn state(&self) -> HealingState {
        self.state
    }

    /// True once the cycle has entered `Detected`
    pub fn entered(&self) -> bool {
        self.entered
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn actions(&self) -> &[AppliedAction] {
        &self.actions
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[HealingState] {
        &self.history
    }

    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.config.max_retries
    }

    /// Count a collector attempt against the budget
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        debug!("Collector attempt {}/{}", self.attempts, self.config.max_retries);
    }

    fn transition_to(&mut self, next: HealingState) {
        if self.state != next {
            debug!("Healing: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.history.push(next);
    }

    fn apply(&mut self, action: HealingAction, detail: impl Into<String>) {
        let detail = detail.into();
        info!("Healing action {}: {}", action, detail);
        self.actions.push(AppliedAction { action, detail });
    }

    /// Drive the machine for one failed attempt and decide what follows.
    ///
    /// Threshold corrections are written into `detector`, which the caller
    /// owns for this cycle only.
    pub fn handle(
        &mut self,
        trigger: &HealingTrigger,
        detector: &mut AnomalyDetector,
    ) -> HealingDecision {
        if self.state == HealingState::Escalated {
            return HealingDecision::Escalate;
        }

        if !self.entered {
            self.entered = true;
            warn!("Self-healing triggered: {}", trigger.describe());
        }

        self.transition_to(HealingState::Detected);

        self.transition_to(HealingState::Logged);
        self.apply(HealingAction::LogOnly, trigger.describe());

        if self.budget_exhausted() {
            self.transition_to(HealingState::Escalated);
            self.apply(
                HealingAction::Escalate,
                format!(
                    "Retry budget exhausted after {} attempts",
                    self.attempts
                ),
            );
            warn!("Healing escalated after {} attempts", self.attempts);
            return HealingDecision::Escalate;
        }

        let pause = self.config.pause_for_retry(self.attempts);
        self.transition_to(HealingState::Paused);
        self.apply(HealingAction::Pause, format!("Waiting {:?} before retry", pause));

        if trigger.is_structural() {
            self.transition_to(HealingState::Diagnosing);
            if let HealingTrigger::Anomalies(anomalies) = trigger {
                self.diagnose(anomalies, detector);
            }
        }

        self.transition_to(HealingState::Resumed);
        HealingDecision::Retry { pause }
    }

    fn diagnose(&mut self, anomalies: &[Anomaly], detector: &mut AnomalyDetector) {
        for anomaly in anomalies.iter().filter(|a| a.kind.is_structural()) {
            match anomaly.kind {
                AnomalyKind::TooFewItems => {
                    let current = detector.thresholds().min_items_per_page;
                    let floor = current * self.config.min_items_floor_ratio;
                    let observed = anomaly.value.floor();

                    if observed > 0.0 && observed >= floor && observed < current {
                        self.apply(
                            HealingAction::Diagnose,
                            format!(
                                "Source lists {:.1} items per page; page size likely reduced",
                                anomaly.value
                            ),
                        );
                        self.transition_to(HealingState::Adjusting);
                        detector.thresholds_mut().min_items_per_page = observed;
                        self.apply(
                            HealingAction::AdjustThreshold,
                            format!("min_items_per_page {} -> {} for this cycle", current, observed),
                        );
                    } else {
                        self.apply(
                            HealingAction::Diagnose,
                            format!(
                                "{:.1} items per page is below the recalibration floor {:.1}; page structure suspect",
                                anomaly.value, floor
                            ),
                        );
                    }
                }
                AnomalyKind::MissingFields => {
                    self.apply(
                        HealingAction::Diagnose,
                        format!("Extraction incomplete: {}", anomaly.detail),
                    );
                }
                _ => {}
            }
        }
    }

    /// Final summary; the state is left as-is
    pub fn report(&self) -> HealingReport {
        HealingReport {
            final_state: self.state,
            entered: self.entered,
            attempts: self.attempts,
            actions: self.actions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anomaly(kind: AnomalyKind, value: f64) -> Anomaly {
        Anomaly {
            kind,
            severity: 1,
            value,
            detail: format!("{} test", kind),
        }
    }

    fn fast_config() -> HealingConfig {
        HealingConfig {
            pause: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn transient() -> HealingTrigger {
        HealingTrigger::TransientError(CollectorError::Transient("timeout".into()))
    }

    #[test]
    fn test_starts_idle() {
        let controller = SelfHealingController::new(HealingConfig::default());
        assert_eq!(controller.state(), HealingState::Idle);
        assert!(!controller.entered());
    }

    #[test]
    fn test_non_structural_skips_diagnosis() {
        let mut controller = SelfHealingController::new(fast_config());
        let mut detector = AnomalyDetector::default();
        controller.record_attempt();

        let trigger = HealingTrigger::Anomalies(vec![anomaly(AnomalyKind::LowQuality, 0.5)]);
        let decision = controller.handle(&trigger, &mut detector);

        assert_eq!(decision, HealingDecision::Retry { pause: Duration::from_millis(10) });
        assert_eq!(
            controller.history(),
            &[
                HealingState::Idle,
                HealingState::Detected,
                HealingState::Logged,
                HealingState::Paused,
                HealingState::Resumed
            ]
        );
        let actions: Vec<HealingAction> = controller.actions().iter().map(|a| a.action).collect();
        assert_eq!(actions, vec![HealingAction::LogOnly, HealingAction::Pause]);
    }

    #[test]
    fn test_too_few_items_recalibrates_threshold() {
        let mut controller = SelfHealingController::new(fast_config());
        let mut detector = AnomalyDetector::default();
        controller.record_attempt();

        let trigger = HealingTrigger::Anomalies(vec![anomaly(AnomalyKind::TooFewItems, 8.4)]);
        controller.handle(&trigger, &mut detector);

        assert_eq!(detector.thresholds().min_items_per_page, 8.0);
        assert!(controller.history().contains(&HealingState::Diagnosing));
        assert!(controller.history().contains(&HealingState::Adjusting));
        assert_eq!(controller.state(), HealingState::Resumed);
        assert!(controller
            .actions()
            .iter()
            .any(|a| a.action == HealingAction::AdjustThreshold));
    }

    #[test]
    fn test_empty_pages_are_not_recalibrated() {
        let mut controller = SelfHealingController::new(fast_config());
        let mut detector = AnomalyDetector::default();
        controller.record_attempt();

        let trigger = HealingTrigger::Anomalies(vec![anomaly(AnomalyKind::TooFewItems, 0.0)]);
        controller.handle(&trigger, &mut detector);

        assert_eq!(detector.thresholds().min_items_per_page, 10.0);
        assert!(controller.history().contains(&HealingState::Diagnosing));
        assert!(!controller.history().contains(&HealingState::Adjusting));
    }

    #[test]
    fn test_escalates_when_budget_exhausted() {
        let mut controller = SelfHealingController::new(fast_config());
        let mut detector = AnomalyDetector::default();

        for _ in 0..2 {
            controller.record_attempt();
            assert!(matches!(
                controller.handle(&transient(), &mut detector),
                HealingDecision::Retry { .. }
            ));
        }

        controller.record_attempt();
        assert_eq!(
            controller.handle(&transient(), &mut detector),
            HealingDecision::Escalate
        );
        assert_eq!(controller.state(), HealingState::Escalated);
        assert_eq!(controller.attempts(), 3);
        assert_eq!(
            controller.actions().last().map(|a| a.action),
            Some(HealingAction::Escalate)
        );

        // Terminal
        assert_eq!(
            controller.handle(&transient(), &mut detector),
            HealingDecision::Escalate
        );
    }

    #[test]
    fn test_every_detection_is_logged() {
        let mut controller = SelfHealingController::new(fast_config());
        let mut detector = AnomalyDetector::default();

        for _ in 0..3 {
            controller.record_attempt();
            controller.handle(&transient(), &mut detector);
        }

        let logged = controller
            .actions()
            .iter()
            .filter(|a| a.action == HealingAction::LogOnly)
            .count();
        assert_eq!(logged, 3);
    }

    #[test]
    fn test_pause_backoff_is_bounded() {
        let config = HealingConfig {
            pause: Duration::from_secs(5),
            max_pause: Duration::from_secs(12),
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(config.pause_for_retry(1), Duration::from_secs(5));
        assert_eq!(config.pause_for_retry(2), Duration::from_secs(10));
        assert_eq!(config.pause_for_retry(3), Duration::from_secs(12));
    }

    #[test]
    fn test_pause_for_large_retry_index_is_capped() {
        let config = HealingConfig {
            max_retries: 100,
            ..Default::default()
        };
        assert_eq!(config.pause_for_retry(66), config.max_pause);
        assert_eq!(config.pause_for_retry(1_100), config.max_pause);
        assert_eq!(config.pause_for_retry(u32::MAX), config.max_pause);
    }

    #[test]
    fn test_report() {
        let mut controller = SelfHealingController::new(fast_config());
        let mut detector = AnomalyDetector::default();
        controller.record_attempt();
        controller.handle(&transient(), &mut detector);

        let report = controller.report();
        assert!(report.entered);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.final_state, HealingState::Resumed);
        assert_eq!(report.actions.len(), 2);
    }
}
