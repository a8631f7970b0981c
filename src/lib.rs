//! ScrapeBot Agent
//!
//! Autonomous control loop for a periodic data-collection job. Each cycle
//! the agent picks how hard to push the source from its recent history,
//! runs the collection, checks what came back, repairs what it can inside
//! the cycle, and records the outcome for the next decision.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──► CycleCoordinator ──► StrategyPolicy (reads MetricsStore)
//!                     │
//!                     ├── Collector (paged fan-out, HTTP source)
//!                     ├── AnomalyDetector
//!                     ├── SelfHealingController (retry / escalate)
//!                     └── commit: MetricsStore + SessionLog (SQLite, listings upserted)
//! ```

pub mod anomaly;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod healing;
pub mod metrics;
pub mod report;
pub mod scheduler;
pub mod session_log;
pub mod strategy;

pub use anomaly::{Anomaly, AnomalyDetector, AnomalyKind, CollectedItem, DetectorThresholds, RunResult};
pub use collector::{Collector, HttpPageSource, PageSource, PagedCollector};
pub use config::Config;
pub use coordinator::CycleCoordinator;
pub use error::{AgentError, CollectorError, ConfigError};
pub use healing::{HealingAction, HealingConfig, HealingDecision, HealingState, SelfHealingController};
pub use metrics::{CycleOutcome, MetricsStore, PerformanceState};
pub use scheduler::{CycleScheduler, SchedulerStats};
pub use session_log::{CycleKind, Listing, ListingCounts, SessionLog, SessionRecord, StoredListing};
pub use strategy::{PolicyConfig, Strategy, StrategyParams, StrategyPolicy, StrategyTable, Task};
