use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open run ledger {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            app_id      TEXT NOT NULL,
            outcome     TEXT NOT NULL CHECK(outcome IN ('done','failed')),
            source      TEXT,
            source_url  TEXT,
            score       INTEGER,
            categories  INTEGER,
            error       TEXT,
            latency_ms  INTEGER NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_runs_app ON runs(app_id);
        ",
    )?;
    Ok(())
}

/// One finished pipeline run, as recorded by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRow {
    pub app_id: String,
    /// `cache`, `remote` or `keyword`. None for failed runs.
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub score: Option<u32>,
    pub categories: Option<usize>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl RunRow {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub fn insert_run(conn: &Connection, row: &RunRow) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (app_id, outcome, source, source_url, score, categories, error, latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            row.app_id,
            if row.is_ok() { "done" } else { "failed" },
            row.source,
            row.source_url,
            row.score,
            row.categories.map(|c| c as i64),
            row.error,
            row.latency_ms as i64,
        ],
    )?;
    Ok(())
}

pub struct HistoryRow {
    pub app_id: String,
    pub outcome: String,
    pub source: String,
    pub score: Option<u32>,
    pub error: String,
    pub latency_ms: u64,
    pub created_at: String,
}

/// Most recent runs first.
pub fn fetch_history(conn: &Connection, app_id: Option<&str>, limit: usize) -> Result<Vec<HistoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT app_id, outcome, COALESCE(source, ''), score, COALESCE(error, ''), latency_ms, created_at
         FROM runs
         WHERE ?1 IS NULL OR app_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![app_id, limit as i64], |r| {
            Ok(HistoryRow {
                app_id: r.get(0)?,
                outcome: r.get(1)?,
                source: r.get(2)?,
                score: r.get(3)?,
                error: r.get(4)?,
                latency_ms: r.get::<_, i64>(5)? as u64,
                created_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct Stats {
    pub runs: usize,
    pub apps: usize,
    pub done: usize,
    pub failed: usize,
    pub from_cache: usize,
    pub from_remote: usize,
    pub from_keyword: usize,
    pub avg_latency_ms: Option<f64>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    let runs = count("SELECT COUNT(*) FROM runs")?;
    let apps = count("SELECT COUNT(DISTINCT app_id) FROM runs")?;
    let done = count("SELECT COUNT(*) FROM runs WHERE outcome = 'done'")?;
    let from_cache = count("SELECT COUNT(*) FROM runs WHERE source = 'cache'")?;
    let from_remote = count("SELECT COUNT(*) FROM runs WHERE source = 'remote'")?;
    let from_keyword = count("SELECT COUNT(*) FROM runs WHERE source = 'keyword'")?;
    let avg_latency_ms: Option<f64> =
        conn.query_row("SELECT AVG(latency_ms) FROM runs", [], |r| r.get(0))?;
    Ok(Stats {
        runs,
        apps,
        done,
        failed: runs - done,
        from_cache,
        from_remote,
        from_keyword,
        avg_latency_ms,
    })
}

// ── Tests ──
