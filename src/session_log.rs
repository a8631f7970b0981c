//! Session Log
//!
//! Append-only record of every cycle plus the last committed performance
//! state, stored in SQLite next to the deduplicated listings the cycles
//! collected. One transaction per cycle covers all three, so a monitoring
//! reader never sees a session without its metrics (or the reverse). WAL
//! mode lets read-only connections query the last committed data while a
//! write is pending.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::anomaly::{Anomaly, CollectedItem};
use crate::healing::{AppliedAction, HealingState};
use crate::metrics::PerformanceState;
use crate::strategy::Strategy;

/// Metrics snapshots kept for history
const METRICS_HISTORY: i64 = 500;

/// How a cycle was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Policy-driven cycle
    Scheduled,
    /// Policy bypassed, extended page budget
    FullSweep,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::FullSweep => "full_sweep",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "full_sweep" => Self::FullSweep,
            _ => Self::Scheduled,
        }
    }
}

/// Durable summary of one cycle, never mutated after append
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub pages: u32,
    pub items: usize,
    pub errors: usize,
    pub anomalies: Vec<Anomaly>,
    pub actions: Vec<AppliedAction>,
    pub healing_state: HealingState,
    /// Listings seen for the first time in this cycle
    pub new_listings: usize,
    /// Listings already stored and refreshed by this cycle
    pub updated_listings: usize,
    /// Cut short by the cycle deadline
    pub aborted: bool,
    pub success: bool,
}

impl SessionRecord {
    pub fn duration_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// One collected item with its weighted completeness, ready to upsert
#[derive(Debug, Clone, Copy)]
pub struct Listing<'a> {
    pub item: &'a CollectedItem,
    pub completeness_pct: f64,
}

/// Outcome of upserting one cycle's listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingCounts {
    pub new: usize,
    pub updated: usize,
}

/// A listing as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredListing {
    pub listing_id: String,
    pub item: CollectedItem,
    pub completeness_pct: f64,
    pub first_seen_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub cycle_id: Uuid,
}

/// SQLite-backed session log
pub struct SessionLog {
    conn: Mutex<Connection>,
}

impl SessionLog {
    /// Open or create the log database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session log {}", path.display()))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Session log journal mode: {}", mode);

        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;

        info!("Session log opened: {}", path.display());
        Ok(log)
    }

    /// Read-only connection for monitoring; sees only committed cycles
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open session log {}", path.display()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory log for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let log = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                strategy TEXT NOT NULL,
                pages_scraped INTEGER NOT NULL,
                items_found INTEGER NOT NULL,
                errors_count INTEGER NOT NULL,
                anomalies TEXT NOT NULL,
                healing_actions TEXT NOT NULL,
                healing_state TEXT NOT NULL,
                new_listings INTEGER NOT NULL DEFAULT 0,
                updated_listings INTEGER NOT NULL DEFAULT 0,
                aborted INTEGER NOT NULL,
                success INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_time);

            CREATE TRIGGER IF NOT EXISTS sessions_no_update
            BEFORE UPDATE ON sessions
            BEGIN
                SELECT RAISE(ABORT, 'sessions are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS sessions_no_delete
            BEFORE DELETE ON sessions
            BEGIN
                SELECT RAISE(ABORT, 'sessions are append-only');
            END;

            CREATE TABLE IF NOT EXISTS agent_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS listings (
                listing_id TEXT PRIMARY KEY,
                region TEXT,
                nature TEXT,
                type TEXT,
                description TEXT,
                price REAL,
                date_modified TEXT,
                url TEXT,
                fields TEXT NOT NULL,
                completeness REAL NOT NULL,
                first_seen_at TEXT NOT NULL,
                scraped_at TEXT NOT NULL,
                cycle_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_listings_scraped ON listings(scraped_at);
            "#,
        )?;

        Ok(())
    }

    /// Upsert the cycle's listings, append the session and the resulting
    /// metrics in one transaction. The session row carries the returned
    /// counts; the caller's record is stored as given otherwise.
    pub fn commit(
        &self,
        record: &SessionRecord,
        listings: &[Listing<'_>],
        state: &PerformanceState,
    ) -> Result<ListingCounts> {
        let anomalies = serde_json::to_string(&record.anomalies)?;
        let actions = serde_json::to_string(&record.actions)?;
        let state_json = serde_json::to_string(state)?;
        let cycle_id = record.cycle_id.to_string();
        let scraped_at = timestamp(&record.ended_at);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut counts = ListingCounts::default();
        {
            let mut exists = tx.prepare_cached("SELECT 1 FROM listings WHERE listing_id = ?1")?;
            let mut upsert = tx.prepare_cached(
                "INSERT INTO listings
                 (listing_id, region, nature, type, description, price, date_modified, url,
                  fields, completeness, first_seen_at, scraped_at, cycle_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?12)
                 ON CONFLICT(listing_id) DO UPDATE SET
                    region = excluded.region,
                    nature = excluded.nature,
                    type = excluded.type,
                    description = excluded.description,
                    price = excluded.price,
                    date_modified = excluded.date_modified,
                    url = excluded.url,
                    fields = excluded.fields,
                    completeness = excluded.completeness,
                    scraped_at = excluded.scraped_at,
                    cycle_id = excluded.cycle_id",
            )?;

            for listing in listings {
                let item = listing.item;
                let listing_id = item.listing_id();
                let seen: Option<i64> = exists
                    .query_row(params![listing_id], |row| row.get(0))
                    .optional()?;
                if seen.is_some() {
                    counts.updated += 1;
                } else {
                    counts.new += 1;
                }

                upsert.execute(params![
                    listing_id,
                    item.text("region"),
                    item.text("nature"),
                    item.text("type"),
                    item.text("description"),
                    item.number("price"),
                    item.text("date_modified"),
                    item.text("url"),
                    serde_json::to_string(item)?,
                    listing.completeness_pct,
                    scraped_at,
                    cycle_id,
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO sessions
             (cycle_id, kind, start_time, end_time, strategy, pages_scraped, items_found,
              errors_count, anomalies, healing_actions, healing_state, new_listings,
              updated_listings, aborted, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                cycle_id,
                record.kind.as_str(),
                timestamp(&record.started_at),
                timestamp(&record.ended_at),
                record.strategy.as_str(),
                record.pages,
                record.items as i64,
                record.errors as i64,
                anomalies,
                actions,
                record.healing_state.as_str(),
                counts.new as i64,
                counts.updated as i64,
                record.aborted,
                record.success,
            ],
        )?;

        tx.execute(
            "INSERT INTO agent_metrics (timestamp, state) VALUES (?1, ?2)",
            params![timestamp(&record.ended_at), state_json],
        )?;

        tx.execute(
            "DELETE FROM agent_metrics WHERE id NOT IN (
                 SELECT id FROM agent_metrics ORDER BY id DESC LIMIT ?1
             )",
            params![METRICS_HISTORY],
        )?;

        tx.commit()?;

        debug!(
            "Session {} appended ({} anomalies, {} actions, {} new / {} updated listings)",
            record.cycle_id,
            record.anomalies.len(),
            record.actions.len(),
            counts.new,
            counts.updated
        );
        Ok(counts)
    }

    /// Number of recorded sessions
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of distinct listings stored
    pub fn listing_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Look up one stored listing by its dedup key
    pub fn listing(&self, listing_id: &str) -> Result<Option<StoredListing>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT listing_id, fields, completeness, first_seen_at, scraped_at, cycle_id
                 FROM listings WHERE listing_id = ?1",
                params![listing_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((listing_id, fields, completeness_pct, first_seen_at, scraped_at, cycle_id)) = row
        else {
            return Ok(None);
        };

        Ok(Some(StoredListing {
            listing_id,
            item: serde_json::from_str(&fields).context("Corrupt listing fields")?,
            completeness_pct,
            first_seen_at: DateTime::parse_from_rfc3339(&first_seen_at)?.with_timezone(&Utc),
            scraped_at: DateTime::parse_from_rfc3339(&scraped_at)?.with_timezone(&Utc),
            cycle_id: Uuid::parse_str(&cycle_id)?,
        }))
    }

    /// Most recent sessions, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT cycle_id, kind, start_time, end_time, strategy, pages_scraped, items_found,
                    errors_count, anomalies, healing_actions, healing_state, new_listings,
                    updated_listings, aborted, success
             FROM sessions
             ORDER BY start_time DESC, id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], raw_session)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Last committed performance state, if any cycle ran before
    pub fn latest_metrics(&self) -> Result<Option<PerformanceState>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT state FROM agent_metrics ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Corrupt metrics snapshot")?,
            )),
            None => Ok(None),
        }
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Row as stored, before decoding JSON and enum columns
struct RawSession {
    cycle_id: String,
    kind: String,
    start_time: String,
    end_time: String,
    strategy: String,
    pages: u32,
    items: i64,
    errors: i64,
    anomalies: String,
    actions: String,
    healing_state: String,
    new_listings: i64,
    updated_listings: i64,
    aborted: bool,
    success: bool,
}

fn raw_session(row: &Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        cycle_id: row.get(0)?,
        kind: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        strategy: row.get(4)?,
        pages: row.get(5)?,
        items: row.get(6)?,
        errors: row.get(7)?,
        anomalies: row.get(8)?,
        actions: row.get(9)?,
        healing_state: row.get(10)?,
        new_listings: row.get(11)?,
        updated_listings: row.get(12)?,
        aborted: row.get(13)?,
        success: row.get(14)?,
    })
}

impl RawSession {
    fn into_record(self) -> Result<SessionRecord> {
        Ok(SessionRecord {
            cycle_id: Uuid::parse_str(&self.cycle_id)?,
            kind: CycleKind::parse(&self.kind),
            started_at: DateTime::parse_from_rfc3339(&self.start_time)?.with_timezone(&Utc),
            ended_at: DateTime::parse_from_rfc3339(&self.end_time)?.with_timezone(&Utc),
            strategy: self.strategy.parse::<Strategy>().map_err(anyhow::Error::msg)?,
            pages: self.pages,
            items: self.items.max(0) as usize,
            errors: self.errors.max(0) as usize,
            anomalies: serde_json::from_str(&self.anomalies)?,
            actions: serde_json::from_str(&self.actions)?,
            healing_state: self.healing_state.parse::<HealingState>().map_err(anyhow::Error::msg)?,
            new_listings: self.new_listings.max(0) as usize,
            updated_listings: self.updated_listings.max(0) as usize,
            aborted: self.aborted,
            success: self.success,
        })
    }
}
