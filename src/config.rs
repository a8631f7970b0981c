//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::anomaly::{DetectorThresholds, NumericBand};
use crate::error::ConfigError;
use crate::healing::HealingConfig;
use crate::strategy::{PolicyConfig, StrategyTable};

/// Upper bound on collector attempts per cycle
pub const MAX_RETRIES_LIMIT: u32 = 20;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database for sessions and metrics
    pub db_path: PathBuf,

    /// Listing endpoint for the HTTP page source (optional)
    pub source_url: Option<String>,

    /// Rolling error rate above which the agent slows down
    pub error_threshold: f64,

    /// Quality floor shared by the policy and the detector
    pub quality_threshold: f64,

    /// Rolling success rate above which the agent speeds up
    pub success_threshold: f64,

    pub min_items_per_page: f64,

    /// Sane price band, inclusive
    pub price_min: f64,
    pub price_max: f64,

    /// Collector attempts per cycle, first attempt included
    pub max_retries: u32,

    /// Pause before the first in-cycle retry
    pub heal_pause: Duration,

    /// Cycles in the rolling metrics window
    pub metrics_window: usize,

    pub cycle_interval: Duration,

    /// Hard limit on one cycle's execute and heal phase
    pub cycle_deadline: Duration,

    pub request_timeout: Duration,

    /// Page budget for an on-demand full sweep
    pub full_sweep_pages: u32,

    pub strategies: StrategyTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            source_url: None,
            error_threshold: 0.30,
            quality_threshold: 0.80,
            success_threshold: 0.90,
            min_items_per_page: 10.0,
            price_min: 1_000.0,
            price_max: 100_000_000.0,
            max_retries: 3,
            heal_pause: Duration::from_secs(5),
            metrics_window: 20,
            cycle_interval: Duration::from_secs(6 * 60 * 60),
            cycle_deadline: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(15),
            full_sweep_pages: 50,
            strategies: StrategyTable::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("SCRAPEBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let source_url = lookup("SCRAPEBOT_SOURCE_URL").filter(|v| !v.trim().is_empty());

        let strategies = match lookup("SCRAPEBOT_STRATEGY_FILE") {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read strategy file {}", path))?;
                StrategyTable::from_toml(&content)?
            }
            None => defaults.strategies,
        };

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            env_or(&lookup, name, default.as_secs()).map(Duration::from_secs)
        };

        let config = Self {
            db_path,
            source_url,
            error_threshold: env_or(&lookup, "SCRAPEBOT_ERROR_THRESHOLD", defaults.error_threshold)?,
            quality_threshold: env_or(
                &lookup,
                "SCRAPEBOT_QUALITY_THRESHOLD",
                defaults.quality_threshold,
            )?,
            success_threshold: env_or(
                &lookup,
                "SCRAPEBOT_SUCCESS_THRESHOLD",
                defaults.success_threshold,
            )?,
            min_items_per_page: env_or(
                &lookup,
                "SCRAPEBOT_MIN_ITEMS_PER_PAGE",
                defaults.min_items_per_page,
            )?,
            price_min: env_or(&lookup, "SCRAPEBOT_PRICE_MIN", defaults.price_min)?,
            price_max: env_or(&lookup, "SCRAPEBOT_PRICE_MAX", defaults.price_max)?,
            max_retries: env_or(&lookup, "SCRAPEBOT_MAX_RETRIES", defaults.max_retries)?,
            heal_pause: secs("SCRAPEBOT_HEAL_PAUSE_SECS", defaults.heal_pause)?,
            metrics_window: env_or(&lookup, "SCRAPEBOT_METRICS_WINDOW", defaults.metrics_window)?,
            cycle_interval: secs("SCRAPEBOT_CYCLE_INTERVAL_SECS", defaults.cycle_interval)?,
            cycle_deadline: secs("SCRAPEBOT_CYCLE_DEADLINE_SECS", defaults.cycle_deadline)?,
            request_timeout: secs("SCRAPEBOT_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            full_sweep_pages: env_or(
                &lookup,
                "SCRAPEBOT_FULL_SWEEP_PAGES",
                defaults.full_sweep_pages,
            )?,
            strategies,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("error_threshold", self.error_threshold),
            ("quality_threshold", self.quality_threshold),
            ("success_threshold", self.success_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }

        if !self.min_items_per_page.is_finite() || self.min_items_per_page < 0.0 {
            return Err(ConfigError::Unparsable {
                name: "min_items_per_page",
                value: self.min_items_per_page.to_string(),
            });
        }

        if !self.price_min.is_finite()
            || !self.price_max.is_finite()
            || self.price_min >= self.price_max
        {
            return Err(ConfigError::InvalidPriceBand {
                min: self.price_min,
                max: self.price_max,
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("max_retries"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::OutOfBounds {
                name: "max_retries",
                value: u64::from(self.max_retries),
                max: u64::from(MAX_RETRIES_LIMIT),
            });
        }
        if self.metrics_window == 0 {
            return Err(ConfigError::Zero("metrics_window"));
        }
        if self.full_sweep_pages == 0 {
            return Err(ConfigError::Zero("full_sweep_pages"));
        }
        if self.cycle_deadline.is_zero() {
            return Err(ConfigError::Zero("cycle_deadline"));
        }

        self.strategies.validate()
    }

    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            error_threshold: self.error_threshold,
            quality_threshold: self.quality_threshold,
            success_threshold: self.success_threshold,
        }
    }

    pub fn detector_thresholds(&self) -> DetectorThresholds {
        DetectorThresholds {
            min_items_per_page: self.min_items_per_page,
            quality_threshold: self.quality_threshold,
            numeric_bands: vec![NumericBand::new("price", self.price_min, self.price_max)],
            ..DetectorThresholds::default()
        }
    }

    pub fn healing_config(&self) -> HealingConfig {
        HealingConfig {
            max_retries: self.max_retries,
            pause: self.heal_pause,
            ..HealingConfig::default()
        }
    }
}

/// Unset or blank falls back to the default; anything else must parse
fn env_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::Unparsable {
                name,
                value: raw.clone(),
            })
        }
        _ => Ok(default),
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scrapebot")
        .join("agent.db")
}
