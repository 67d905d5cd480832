use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use rusqlite::Connection;

use crate::types::{RecordStatus, TemplateDescriptor};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS templates (
            id            TEXT PRIMARY KEY,
            title         TEXT NOT NULL,
            source_url    TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'pending'
                          CHECK(status IN ('pending','done','partial','failed')),
            attempts      INTEGER NOT NULL DEFAULT 0,
            recorded      BOOLEAN NOT NULL DEFAULT 0,
            last_error    TEXT,
            discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_templates_status ON templates(status);
        ",
    )?;
    Ok(())
}

// ── Discovery ──

/// Queue newly discovered descriptors; ids already present are left alone.
pub fn insert_discovered(conn: &Connection, descriptors: &[TemplateDescriptor]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO templates (id, title, source_url) VALUES (?1, ?2, ?3)",
        )?;
        for d in descriptors {
            count += stmt.execute(rusqlite::params![d.id, d.title, d.source_url])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Processing queue ──

/// One descriptor due for processing plus the attempts it has already burned.
pub struct WorkItem {
    pub descriptor: TemplateDescriptor,
    pub attempts: u32,
}

/// Descriptors that still need work: pending ids plus failed ids with retry
/// budget left. Ids with a dataset row (`recorded`) are never returned, which
/// is what makes re-runs network-silent for completed work.
pub fn fetch_processable(
    conn: &Connection,
    max_descriptor_attempts: u32,
    limit: Option<usize>,
) -> Result<Vec<WorkItem>> {
    let sql = format!(
        "SELECT id, title, source_url, attempts FROM templates
         WHERE recorded = 0
           AND (status = 'pending' OR (status = 'failed' AND attempts < ?1))
         ORDER BY discovered_at, id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([max_descriptor_attempts], |row| {
            Ok(WorkItem {
                descriptor: TemplateDescriptor {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    source_url: row.get(2)?,
                },
                attempts: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Terminal transitions ──

/// Checkpoint a terminal transition. `recorded` marks that the dataset row
/// for this id has been appended (and flushed) in this same step.
pub fn record_outcome(
    conn: &Connection,
    id: &str,
    status: &str,
    attempts: u32,
    last_error: Option<&str>,
    recorded: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE templates
         SET status = ?2, attempts = ?3, last_error = ?4, recorded = ?5,
             finished_at = datetime('now')
         WHERE id = ?1",
        rusqlite::params![id, status, attempts, last_error, recorded],
    )?;
    Ok(())
}

/// Fold dataset rows back into the ledger. Covers the crash window between a
/// CSV append and the matching ledger update: any id present in the dataset
/// is terminal, whatever the ledger thought.
pub fn reconcile_dataset(conn: &Connection, rows: &HashMap<String, RecordStatus>) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut fixed = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO templates (id, title, source_url, status, recorded, finished_at)
             VALUES (?1, '', '', ?2, 1, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 recorded = 1,
                 finished_at = COALESCE(finished_at, excluded.finished_at)
             WHERE recorded = 0",
        )?;
        for (id, status) in rows {
            let ledger_status = match status {
                RecordStatus::Ok => "done",
                RecordStatus::Partial => "partial",
                RecordStatus::Failed => "failed",
            };
            fixed += stmt.execute(rusqlite::params![id, ledger_status])?;
        }
    }
    tx.commit()?;
    Ok(fixed)
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub pending: usize,
    pub done: usize,
    pub partial: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
}

pub fn get_stats(conn: &Connection, max_descriptor_attempts: u32) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    let total = count("SELECT COUNT(*) FROM templates")?;
    let pending = count("SELECT COUNT(*) FROM templates WHERE status = 'pending'")?;
    let done = count("SELECT COUNT(*) FROM templates WHERE status = 'done'")?;
    let partial = count("SELECT COUNT(*) FROM templates WHERE status = 'partial'")?;
    let failed_retryable: usize = conn.query_row(
        "SELECT COUNT(*) FROM templates
         WHERE status = 'failed' AND recorded = 0 AND attempts < ?1",
        [max_descriptor_attempts],
        |r| r.get(0),
    )?;
    let failed_terminal: usize = conn.query_row(
        "SELECT COUNT(*) FROM templates
         WHERE status = 'failed' AND (recorded = 1 OR attempts >= ?1)",
        [max_descriptor_attempts],
        |r| r.get(0),
    )?;
    Ok(Stats {
        total,
        pending,
        done,
        partial,
        failed_retryable,
        failed_terminal,
    })
}

/// Failed ids for the run summary, oldest first.
pub fn failed_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM templates WHERE status = 'failed' ORDER BY discovered_at, id")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
