//! Strategy Selection
//!
//! Converts the rolling performance state into an operating strategy.
//! Selection is an ordered rule table evaluated top to bottom; the first
//! matching rule wins, so tie-breaking is part of the table itself:
//!
//! 1. error rate above threshold      -> Conservative
//! 2. quality score below threshold   -> Minimal
//! 3. success rate above threshold    -> Aggressive
//! 4. otherwise                       -> Balanced
//!
//! With no history the quality score is zero, so the first cycle always
//! starts with Minimal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::metrics::PerformanceState;

/// Named operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Fast, many pages
    Aggressive,
    /// Normal operation
    Balanced,
    /// Slow, careful
    Conservative,
    /// Just check for updates
    Minimal,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Aggressive,
        Strategy::Balanced,
        Strategy::Conservative,
        Strategy::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Balanced => "balanced",
            Self::Conservative => "conservative",
            Self::Minimal => "minimal",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aggressive" => Ok(Self::Aggressive),
            "balanced" => Ok(Self::Balanced),
            "conservative" => Ok(Self::Conservative),
            "minimal" => Ok(Self::Minimal),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Fixed parameter set bound to a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Max pages per run
    pub page_budget: u32,
    /// Inter-request delay in milliseconds
    pub delay_ms: u64,
    /// Priority rank (higher runs first)
    pub priority: u8,
    /// Concurrent page fetches allowed
    pub workers: usize,
}

impl StrategyParams {
    pub const fn new(page_budget: u32, delay_ms: u64, priority: u8, workers: usize) -> Self {
        Self {
            page_budget,
            delay_ms,
            priority,
            workers,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Parameters for every strategy, loadable from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTable {
    pub aggressive: StrategyParams,
    pub balanced: StrategyParams,
    pub conservative: StrategyParams,
    pub minimal: StrategyParams,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            aggressive: StrategyParams::new(20, 1_000, 3, 4),
            balanced: StrategyParams::new(10, 2_000, 2, 2),
            conservative: StrategyParams::new(5, 5_000, 1, 1),
            minimal: StrategyParams::new(1, 3_000, 1, 1),
        }
    }
}

impl StrategyTable {
    /// Parse a table from TOML; missing strategies keep their defaults
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::StrategyFile(e.to_string()))
    }

    pub fn params(&self, strategy: Strategy) -> StrategyParams {
        match strategy {
            Strategy::Aggressive => self.aggressive,
            Strategy::Balanced => self.balanced,
            Strategy::Conservative => self.conservative,
            Strategy::Minimal => self.minimal,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for strategy in Strategy::ALL {
            let params = self.params(strategy);
            let invalid = |reason: &str| ConfigError::InvalidStrategy {
                strategy: strategy.to_string(),
                reason: reason.to_string(),
            };

            if params.page_budget == 0 {
                return Err(invalid("page budget must be greater than zero"));
            }
            if params.workers == 0 {
                return Err(invalid("worker count must be greater than zero"));
            }
        }
        Ok(())
    }
}

/// Thresholds read by the policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyConfig {
    pub error_threshold: f64,
    pub quality_threshold: f64,
    pub success_threshold: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.30,
            quality_threshold: 0.80,
            success_threshold: 0.90,
        }
    }
}

type Predicate = fn(&PerformanceState, &PolicyConfig) -> bool;

/// One row of the ordered policy table
#[derive(Clone, Copy)]
pub struct PolicyRule {
    pub name: &'static str,
    pub strategy: Strategy,
    predicate: Predicate,
}

impl PolicyRule {
    pub fn matches(&self, state: &PerformanceState, config: &PolicyConfig) -> bool {
        (self.predicate)(state, config)
    }
}

impl fmt::Debug for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRule")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// The policy decision and the rule that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub strategy: Strategy,
    pub rule: &'static str,
}

/// Pure decision function: performance state -> strategy
#[derive(Debug, Clone)]
pub struct StrategyPolicy {
    config: PolicyConfig,
    rules: Vec<PolicyRule>,
}

impl StrategyPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        let rules = vec![
            PolicyRule {
                name: "high error rate",
                strategy: Strategy::Conservative,
                predicate: |s, c| s.error_rate > c.error_threshold,
            },
            PolicyRule {
                name: "low data quality",
                strategy: Strategy::Minimal,
                predicate: |s, c| s.quality_score < c.quality_threshold,
            },
            PolicyRule {
                name: "high success rate",
                strategy: Strategy::Aggressive,
                predicate: |s, c| s.success_rate > c.success_threshold,
            },
            PolicyRule {
                name: "normal conditions",
                strategy: Strategy::Balanced,
                predicate: |_, _| true,
            },
        ];

        Self { config, rules }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Ordered rule table, first match wins
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Evaluate the table and report which rule fired
    pub fn decide(&self, state: &PerformanceState) -> Decision {
        self.rules
            .iter()
            .find(|rule| rule.matches(state, &self.config))
            .map(|rule| Decision {
                strategy: rule.strategy,
                rule: rule.name,
            })
            .unwrap_or(Decision {
                strategy: Strategy::Balanced,
                rule: "normal conditions",
            })
    }

    pub fn select(&self, state: &PerformanceState) -> Strategy {
        self.decide(state).strategy
    }
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// One cycle's instantiation of a strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    cycle_id: Uuid,
    strategy: Strategy,
    params: StrategyParams,
}

impl Task {
    pub fn new(cycle_id: Uuid, strategy: Strategy, params: StrategyParams) -> Self {
        Self {
            cycle_id,
            strategy,
            params,
        }
    }

    /// Build a task from a strategy's configured parameters
    pub fn from_strategy(cycle_id: Uuid, strategy: Strategy, table: &StrategyTable) -> Self {
        let task = Self::new(cycle_id, strategy, table.params(strategy));
        info!(
            "Task {}: {} (pages={}, delay={}ms, priority={}, workers={})",
            cycle_id,
            strategy.as_str().to_uppercase(),
            task.params.page_budget,
            task.params.delay_ms,
            task.params.priority,
            task.params.workers
        );
        task
    }

    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn page_budget(&self) -> u32 {
        self.params.page_budget
    }

    pub fn delay(&self) -> Duration {
        self.params.delay()
    }

    pub fn priority(&self) -> u8 {
        self.params.priority
    }

    pub fn workers(&self) -> usize {
        self.params.workers
    }
}
