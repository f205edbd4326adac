//! Structured per-record event log
//!
//! Validation failures, conflicts and records flagged for manual review
//! accumulate here keyed by `(kind, pid, event_id)`. The monitor surfaces
//! the tail.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::types::{now_rfc3339, EntityKind, Result};

/// Severity of a logged entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Review,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Review => "review",
        }
    }
}

/// A single event-log entry
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub event_id: String,
    pub kind: String,
    pub pid: String,
    pub severity: String,
    pub message: String,
    pub created: String,
}

impl LogEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get("event_id")?,
            kind: row.get("kind")?,
            pid: row.get("pid")?,
            severity: row.get("severity")?,
            message: row.get("message")?,
            created: row.get("created")?,
        })
    }
}

/// Append an entry
pub fn append(
    conn: &Connection,
    event_id: &str,
    kind: EntityKind,
    pid: &str,
    severity: Severity,
    message: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO event_log (event_id, kind, pid, severity, message, created)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            event_id,
            kind.as_str(),
            pid,
            severity.as_str(),
            message,
            now_rfc3339()
        ],
    )?;
    Ok(())
}

/// Latest entries, newest first
pub fn tail(conn: &Connection, limit: u32) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, kind, pid, severity, message, created
         FROM event_log ORDER BY id DESC LIMIT ?",
    )?;
    let entries = stmt
        .query_map(params![limit], LogEntry::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Entries for one record, newest first
pub fn for_record(conn: &Connection, kind: EntityKind, pid: &str) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, kind, pid, severity, message, created
         FROM event_log WHERE kind = ? AND pid = ? ORDER BY id DESC",
    )?;
    let entries = stmt
        .query_map(params![kind.as_str(), pid], LogEntry::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[tokio::test]
    async fn test_append_and_tail() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();

        db.read(|conn| {
            append(conn, "ev-1", EntityKind::AgentGnd, "p1", Severity::Error, "bad payload")?;
            append(conn, "ev-2", EntityKind::AgentGnd, "p1", Severity::Review, "cycle")?;

            let entries = tail(conn, 10)?;
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].event_id, "ev-2");

            let for_p1 = for_record(conn, EntityKind::AgentGnd, "p1")?;
            assert_eq!(for_p1.len(), 2);
            Ok(())
        })
        .await
        .unwrap();
    }
}
