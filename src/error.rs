//! Error Taxonomy
//!
//! Collector failures are split into transient (retry within the healing
//! budget) and permanent (treated as an immediate data anomaly).
//! Configuration errors are fatal at startup.

use thiserror::Error;

/// Errors raised by an external collector
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectorError {
    /// Network/timeout failure, retry likely to succeed
    #[error("Transient collection error: {0}")]
    Transient(String),

    /// Parse/schema failure, retry won't help
    #[error("Permanent collection error: {0}")]
    Permanent(String),
}

impl CollectorError {
    /// Classify an error from its message
    pub fn classify(error: &str) -> Self {
        let lower = error.to_lowercase();

        let transient = lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("temporary")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("unavailable");

        if transient {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// Invalid configuration, detected at startup
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Threshold '{name}' must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("Strategy {strategy}: {reason}")]
    InvalidStrategy { strategy: String, reason: String },

    #[error("Invalid price band: min {min} must be below max {max}")]
    InvalidPriceBand { min: f64, max: f64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} is not a valid value: '{value}'")]
    Unparsable { name: &'static str, value: String },

    #[error("{name} must be at most {max}, got {value}")]
    OutOfBounds { name: &'static str, value: u64, max: u64 },

    #[error("Failed to load strategy file: {0}")]
    StrategyFile(String),
}

/// Top-level agent errors surfaced to the scheduler
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("A cycle is already running")]
    CycleInProgress,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CollectorError::classify("connection reset by peer").is_retryable());
        assert!(CollectorError::classify("request timed out").is_retryable());
        assert!(CollectorError::classify("HTTP 503 Service Unavailable").is_retryable());
        assert!(CollectorError::classify("HTTP 429 Too Many Requests").is_retryable());
        assert!(!CollectorError::classify("expected array at line 1").is_retryable());
        assert!(!CollectorError::classify("HTTP 404 Not Found").is_retryable());
    }

    #[test]
    fn test_message_preserved() {
        let err = CollectorError::classify("request timed out");
        assert_eq!(err.message(), "request timed out");
        assert_eq!(err.to_string(), "Transient collection error: request timed out");
    }
}
