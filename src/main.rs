//! ScrapeBot Agent - Entry Point
//!
//! Modes:
//! - Default: run one policy-driven cycle and exit
//! - --continuous / -c: run cycles on the configured interval until Ctrl+C
//! - --full / -f: run one full sweep and exit
//! - --report / -r: print metrics and recent sessions, no collection

use std::sync::Arc;

use anyhow::Context;
use scrapebot_agent::{
    report, Config, CycleCoordinator, CycleScheduler, HttpPageSource, PagedCollector, SessionLog,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const REPORT_SESSIONS: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let continuous_mode = args.iter().any(|a| a == "--continuous" || a == "-c");
    let full_mode = args.iter().any(|a| a == "--full" || a == "-f");
    let report_mode = args.iter().any(|a| a == "--report" || a == "-r");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("ScrapeBot Agent v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: scrapebot-agent [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --continuous, -c   Run cycles on a timer until Ctrl+C");
        println!("  --full, -f         Run one full sweep (policy bypassed)");
        println!("  --report, -r       Show metrics and recent sessions");
        println!("  --help, -h         Show this help");
        println!();
        println!("Default: run one cycle and exit");
        println!();
        println!("Environment variables:");
        println!("  SCRAPEBOT_SOURCE_URL            Listing endpoint (required to collect)");
        println!("  SCRAPEBOT_DB_PATH               Session log database");
        println!("  SCRAPEBOT_CYCLE_INTERVAL_SECS   Interval in continuous mode (default: 21600)");
        println!("  SCRAPEBOT_STRATEGY_FILE         TOML strategy table override");
        println!("  SCRAPEBOT_LOG_JSON              Log JSON to stderr when set to 1");
        return Ok(());
    }

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let json_logs = std::env::var("SCRAPEBOT_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;

    if report_mode {
        let log = SessionLog::open_read_only(&config.db_path)?;
        let state = log.latest_metrics()?.unwrap_or_default();
        println!("{}", report::format_performance(&state));
        println!("  Listings:      {}", log.listing_count()?);
        println!();
        println!("{}", report::format_sessions(&log.recent(REPORT_SESSIONS)?));
        return Ok(());
    }

    info!("ScrapeBot Agent v{}", env!("CARGO_PKG_VERSION"));

    let source_url = config
        .source_url
        .clone()
        .context("SCRAPEBOT_SOURCE_URL must be set to collect")?;
    let source = HttpPageSource::new(source_url, config.request_timeout)?;
    let collector = Arc::new(PagedCollector::new(source));
    let log = Arc::new(SessionLog::open(&config.db_path)?);
    let period = config.cycle_interval;
    let coordinator = Arc::new(CycleCoordinator::new(config, log, collector)?);

    if continuous_mode {
        let scheduler = Arc::new(CycleScheduler::new(Arc::clone(&coordinator), period));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, finishing current cycle");
                let _ = shutdown_tx.send(true);
            }
        });

        scheduler.run_continuous(shutdown_rx).await;
    } else {
        let record = if full_mode {
            coordinator.run_full_sweep().await?
        } else {
            coordinator.run_cycle().await?
        };

        if !record.success {
            warn!("Cycle {} did not succeed", record.cycle_id);
        }
        println!("{}", report::format_performance(&coordinator.performance()));
    }

    Ok(())
}
