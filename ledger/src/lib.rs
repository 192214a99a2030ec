//! Usage Ledger - durable, append-only token accounting.
//!
//! One SQLite table records a row per completed model call. Rows are never
//! updated or deleted here; the store stamps each row at insert time.
//!
//! Every operation opens its own short-lived connection. The database runs in
//! WAL mode so readers proceed while a write is in flight, and a busy timeout
//! makes concurrent writers queue instead of failing.
//!
//! Usage accounting is best-effort. [`UsageLedger::append`] and the
//! aggregation methods log storage failures and carry on; the `try_*` forms
//! return them for callers (and tests) that want to see them.

mod sqlite_security;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{Connection, params};

pub use envoy_types::{TokenUsage, UsageRecord};

use crate::sqlite_security::{prepare_db_path, secure_wal_sidecars};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite `CURRENT_TIMESTAMP` format (UTC).
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-agent usage summary for one game.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Distinct model ids used by the agent, sorted.
    pub models: Vec<String>,
}

/// Whole-game usage totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A stored usage row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub id: i64,
    pub record: UsageRecord,
    /// Store-assigned write time (UTC). `None` if the stored value is unparseable.
    pub recorded_at: Option<NaiveDateTime>,
}

/// Handle to the usage database at a fixed path.
///
/// Cheap to clone; holds no open connection.
#[derive(Debug, Clone)]
pub struct UsageLedger {
    path: PathBuf,
}

impl UsageLedger {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            game_id TEXT NOT NULL,
            agent TEXT NOT NULL,
            phase TEXT NOT NULL,
            model TEXT NOT NULL,
            input INTEGER NOT NULL,
            output INTEGER NOT NULL,
            ts TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_usage_game_agent
        ON usage(game_id, agent);
    ";

    /// Point a ledger at `path`. Nothing is touched until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the ledger at `path` and initialize its schema.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let ledger = Self::new(path);
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the usage table and index if absent. Safe to call repeatedly.
    pub fn initialize_schema(&self) -> Result<()> {
        prepare_db_path(&self.path)?;
        let db = self.connect()?;
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set ledger pragmas")?;
        secure_wal_sidecars(&self.path);
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create ledger schema")?;
        tracing::debug!(path = %self.path.display(), "Usage ledger schema ready");
        Ok(())
    }

    fn connect(&self) -> Result<Connection> {
        let db = Connection::open(&self.path)
            .with_context(|| format!("Failed to open ledger at {}", self.path.display()))?;
        db.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set ledger busy timeout")?;
        Ok(db)
    }

    /// Record one call. Failures are logged, never returned.
    pub fn append(&self, record: &UsageRecord) {
        if let Err(e) = self.try_append(record) {
            tracing::warn!(
                game = %record.game_id,
                agent = %record.agent_id,
                model = %record.model_id,
                "Failed to record usage: {e:#}"
            );
        }
    }

    pub fn try_append(&self, record: &UsageRecord) -> Result<i64> {
        let input = i64::try_from(record.usage.input_tokens).context("input token count overflow")?;
        let output =
            i64::try_from(record.usage.output_tokens).context("output token count overflow")?;

        let db = self.connect()?;
        db.execute(
            "INSERT INTO usage (game_id, agent, phase, model, input, output)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &record.game_id,
                &record.agent_id,
                &record.phase_id,
                &record.model_id,
                input,
                output
            ],
        )
        .context("Failed to insert usage row")?;
        Ok(db.last_insert_rowid())
    }

    /// Per-agent usage for a game. Empty when the game has no rows or the query fails.
    #[must_use]
    pub fn stats_by_agent(&self, game_id: &str) -> BTreeMap<String, AgentUsage> {
        self.try_stats_by_agent(game_id).unwrap_or_else(|e| {
            tracing::warn!(game = game_id, "Failed to read per-agent usage: {e:#}");
            BTreeMap::new()
        })
    }

    pub fn try_stats_by_agent(&self, game_id: &str) -> Result<BTreeMap<String, AgentUsage>> {
        let db = self.connect()?;
        let mut stmt = db
            .prepare(
                "SELECT agent, model, COUNT(*), COALESCE(SUM(input), 0), COALESCE(SUM(output), 0)
                 FROM usage
                 WHERE game_id = ?1
                 GROUP BY agent, model
                 ORDER BY agent ASC, model ASC",
            )
            .context("Failed to prepare per-agent usage query")?;

        let rows = stmt
            .query_map([game_id], |row| {
                let agent: String = row.get(0)?;
                let model: String = row.get(1)?;
                let calls: i64 = row.get(2)?;
                let input: i64 = row.get(3)?;
                let output: i64 = row.get(4)?;
                Ok((agent, model, calls, input, output))
            })
            .context("Failed to query per-agent usage")?;

        let mut stats: BTreeMap<String, AgentUsage> = BTreeMap::new();
        for row in rows {
            let (agent, model, calls, input, output) =
                row.context("Failed to read per-agent usage row")?;
            let entry = stats.entry(agent).or_default();
            entry.calls += to_count(calls);
            entry.input_tokens += to_count(input);
            entry.output_tokens += to_count(output);
            if !entry.models.contains(&model) {
                entry.models.push(model);
            }
        }

        Ok(stats)
    }

    /// Whole-game totals. Zeros when the game has no rows or the query fails.
    #[must_use]
    pub fn total_stats(&self, game_id: &str) -> UsageTotals {
        self.try_total_stats(game_id).unwrap_or_else(|e| {
            tracing::warn!(game = game_id, "Failed to read usage totals: {e:#}");
            UsageTotals::default()
        })
    }

    pub fn try_total_stats(&self, game_id: &str) -> Result<UsageTotals> {
        let db = self.connect()?;
        let (calls, input, output): (i64, i64, i64) = db
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(input), 0), COALESCE(SUM(output), 0)
                 FROM usage
                 WHERE game_id = ?1",
                [game_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to query usage totals")?;

        Ok(UsageTotals {
            calls: to_count(calls),
            input_tokens: to_count(input),
            output_tokens: to_count(output),
        })
    }

    /// All rows for a game, oldest first. Empty when the query fails.
    #[must_use]
    pub fn records(&self, game_id: &str) -> Vec<UsageRow> {
        self.try_records(game_id).unwrap_or_else(|e| {
            tracing::warn!(game = game_id, "Failed to read usage rows: {e:#}");
            Vec::new()
        })
    }

    pub fn try_records(&self, game_id: &str) -> Result<Vec<UsageRow>> {
        let db = self.connect()?;
        let mut stmt = db
            .prepare(
                "SELECT id, game_id, agent, phase, model, input, output, ts
                 FROM usage
                 WHERE game_id = ?1
                 ORDER BY id ASC",
            )
            .context("Failed to prepare usage rows query")?;

        let rows = stmt
            .query_map([game_id], |row| {
                let id: i64 = row.get(0)?;
                let record = UsageRecord {
                    game_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    phase_id: row.get(3)?,
                    model_id: row.get(4)?,
                    usage: TokenUsage::new(to_count(row.get(5)?), to_count(row.get(6)?)),
                };
                let ts: Option<String> = row.get(7)?;
                Ok(UsageRow {
                    id,
                    record,
                    recorded_at: ts.as_deref().and_then(parse_timestamp),
                })
            })
            .context("Failed to query usage rows")?;

        rows.map(|row| row.context("Failed to read usage row"))
            .collect()
    }
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok()
}
