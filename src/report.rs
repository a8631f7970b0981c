//! Human-readable reports over committed metrics and sessions

use std::fmt::Write;

use crate::anomaly::primary_kind;
use crate::metrics::PerformanceState;
use crate::session_log::SessionRecord;

/// Summary of the rolling performance state
pub fn format_performance(state: &PerformanceState) -> String {
    let mut out = String::new();
    let last_run = state
        .last_run_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());

    let _ = writeln!(out, "Agent performance");
    let _ = writeln!(
        out,
        "  Runs:          {} ({} ok, {} failed)",
        state.total_runs(),
        state.successful_runs,
        state.failed_runs
    );
    let _ = writeln!(out, "  Pages:         {}", state.total_pages);
    let _ = writeln!(out, "  Items:         {}", state.total_items);
    let _ = writeln!(out, "  Errors:        {}", state.total_errors);
    let _ = writeln!(out, "  Self-heals:    {}", state.self_heals);
    let _ = writeln!(
        out,
        "  Error rate:    {:.1}% (last {} runs)",
        state.error_rate * 100.0,
        state.window.len()
    );
    let _ = writeln!(out, "  Success rate:  {:.1}%", state.success_rate * 100.0);
    let _ = writeln!(out, "  Quality:       {:.1}%", state.quality_score * 100.0);
    let _ = writeln!(out, "  Avg duration:  {:.1}s", state.avg_duration_secs);
    let _ = write!(out, "  Last run:      {}", last_run);
    out
}

/// One line per session, newest first as given
pub fn format_sessions(sessions: &[SessionRecord]) -> String {
    if sessions.is_empty() {
        return "No sessions recorded".to_string();
    }

    let mut out = String::new();
    for s in sessions {
        let status = if s.aborted {
            "ABORTED"
        } else if s.success {
            "OK"
        } else {
            "FAILED"
        };

        let _ = write!(
            out,
            "{}  {:<7} {:<12} {:>3} pages {:>5} items {:>3} errors  {:>6.1}s  {}",
            s.started_at.format("%Y-%m-%d %H:%M"),
            status,
            s.strategy.as_str(),
            s.pages,
            s.items,
            s.errors,
            s.duration_secs(),
            s.healing_state.as_str()
        );
        if s.new_listings + s.updated_listings > 0 {
            let _ = write!(
                out,
                "  [{} new, {} updated listings]",
                s.new_listings, s.updated_listings
            );
        }
        if !s.anomalies.is_empty() {
            let _ = write!(
                out,
                "  [{} anomalies, mainly {}]",
                s.anomalies.len(),
                primary_kind(&s.anomalies)
            );
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::HealingState;
    use crate::session_log::CycleKind;
    use crate::strategy::Strategy;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_empty_state() {
        let text = format_performance(&PerformanceState::default());
        assert!(text.contains("Runs:          0"));
        assert!(text.contains("Last run:      never"));
    }

    #[test]
    fn test_session_lines() {
        let now = Utc::now();
        let record = SessionRecord {
            cycle_id: Uuid::new_v4(),
            kind: CycleKind::Scheduled,
            started_at: now,
            ended_at: now,
            strategy: Strategy::Conservative,
            pages: 0,
            items: 0,
            errors: 3,
            anomalies: Vec::new(),
            actions: Vec::new(),
            healing_state: HealingState::Escalated,
            new_listings: 0,
            updated_listings: 0,
            aborted: false,
            success: false,
        };
        let refreshed = SessionRecord {
            success: true,
            healing_state: HealingState::Idle,
            new_listings: 4,
            updated_listings: 8,
            ..record.clone()
        };

        let text = format_sessions(&[record]);
        assert!(text.contains("FAILED"));
        assert!(text.contains("conservative"));
        assert!(text.contains("escalated"));
        assert!(!text.contains("listings"));

        let text = format_sessions(&[refreshed]);
        assert!(text.contains("[4 new, 8 updated listings]"));
        assert_eq!(format_sessions(&[]), "No sessions recorded");
    }
}
