//! VIAF cross-walk store, agents only
//!
//! One record per VIAF cluster carrying at most one pid per agent source.
//! A VIAF record is authoritative about membership; physical deletion is
//! allowed and triggers a cluster split in the engine.

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tracing::debug;

use super::{PutAction, RecordMeta};
use crate::db::optional;
use crate::pid;
use crate::types::{now_rfc3339, EntityKind, Result, SourceName};

/// A VIAF cross-walk record
#[derive(Debug, Clone, Serialize)]
pub struct ViafRecord {
    pub pid: String,
    pub gnd_pid: Option<String>,
    pub idref_pid: Option<String>,
    pub rero_pid: Option<String>,
    #[serde(skip)]
    pub meta: RecordMeta,
}

impl ViafRecord {
    /// New record with the given membership
    pub fn new(
        viaf_pid: &str,
        gnd_pid: Option<String>,
        idref_pid: Option<String>,
        rero_pid: Option<String>,
    ) -> Self {
        Self {
            pid: viaf_pid.to_string(),
            gnd_pid,
            idref_pid,
            rero_pid,
            meta: RecordMeta::new(),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            pid: row.get("pid")?,
            gnd_pid: row.get("gnd_pid")?,
            idref_pid: row.get("idref_pid")?,
            rero_pid: row.get("rero_pid")?,
            meta: RecordMeta::from_row(row)?,
        })
    }

    /// Declared membership as `(source, pid)` pairs
    pub fn membership(&self) -> Vec<(SourceName, String)> {
        let mut members = Vec::new();
        if let Some(p) = &self.gnd_pid {
            members.push((SourceName::Gnd, p.clone()));
        }
        if let Some(p) = &self.idref_pid {
            members.push((SourceName::Idref, p.clone()));
        }
        if let Some(p) = &self.rero_pid {
            members.push((SourceName::Rero, p.clone()));
        }
        members
    }

    pub fn source_pid(&self, source: SourceName) -> Option<&str> {
        match source {
            SourceName::Gnd => self.gnd_pid.as_deref(),
            SourceName::Idref => self.idref_pid.as_deref(),
            SourceName::Rero => self.rero_pid.as_deref(),
        }
    }

    pub fn set_source_pid(&mut self, source: SourceName, value: Option<String>) {
        match source {
            SourceName::Gnd => self.gnd_pid = value,
            SourceName::Idref => self.idref_pid = value,
            SourceName::Rero => self.rero_pid = value,
        }
    }
}

const SELECT: &str =
    "SELECT pid, gnd_pid, idref_pid, rero_pid, uuid, created, updated, version FROM viaf_records";

/// Store or refresh a VIAF record.
///
/// Returns the action and the prior stored state (None when newly created)
/// so the engine can diff membership.
pub fn put(conn: &Connection, record: &ViafRecord) -> Result<(PutAction, Option<ViafRecord>)> {
    let existing = get(conn, &record.pid)?;

    let action = match existing {
        Some(ref current)
            if current.gnd_pid == record.gnd_pid
                && current.idref_pid == record.idref_pid
                && current.rero_pid == record.rero_pid =>
        {
            PutAction::Unchanged
        }
        Some(_) => {
            conn.execute(
                "UPDATE viaf_records
                 SET gnd_pid = ?, idref_pid = ?, rero_pid = ?, updated = ?,
                     version = version + 1
                 WHERE pid = ?",
                params![
                    record.gnd_pid,
                    record.idref_pid,
                    record.rero_pid,
                    now_rfc3339(),
                    record.pid
                ],
            )?;
            debug!(viaf = %record.pid, "Updated VIAF record");
            PutAction::Updated
        }
        None => {
            let meta = RecordMeta::new();
            conn.execute(
                "INSERT INTO viaf_records
                 (pid, gnd_pid, idref_pid, rero_pid, uuid, created, updated, version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
                params![
                    record.pid,
                    record.gnd_pid,
                    record.idref_pid,
                    record.rero_pid,
                    meta.uuid,
                    meta.created,
                    meta.updated
                ],
            )?;
            debug!(viaf = %record.pid, "Created VIAF record");
            PutAction::Created
        }
    };

    pid::register(conn, EntityKind::AgentViaf, &record.pid)?;
    pid::reactivate(conn, EntityKind::AgentViaf, &record.pid)?;
    Ok((action, existing))
}

/// Get a VIAF record
pub fn get(conn: &Connection, viaf_pid: &str) -> Result<Option<ViafRecord>> {
    let mut stmt = conn.prepare(&format!("{} WHERE pid = ?", SELECT))?;
    optional(stmt.query_row(params![viaf_pid], ViafRecord::from_row))
}

/// Physically delete a VIAF record. Returns the removed state, if any.
pub fn delete(conn: &Connection, viaf_pid: &str) -> Result<Option<ViafRecord>> {
    let existing = get(conn, viaf_pid)?;
    if existing.is_some() {
        conn.execute("DELETE FROM viaf_records WHERE pid = ?", params![viaf_pid])?;
        pid::mark_deleted(conn, EntityKind::AgentViaf, viaf_pid)?;
        debug!(viaf = %viaf_pid, "Deleted VIAF record");
    }
    Ok(existing)
}

/// The VIAF pid currently claiming a source pid, if any.
///
/// This is the engine's primary join. When several records claim the same
/// source pid the most recently updated one wins; the engine strips the
/// others and the monitor counts the overlap.
pub fn lookup_by_source(
    conn: &Connection,
    source: SourceName,
    source_pid: &str,
) -> Result<Option<String>> {
    let column = match source {
        SourceName::Gnd => "gnd_pid",
        SourceName::Idref => "idref_pid",
        SourceName::Rero => "rero_pid",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT pid FROM viaf_records WHERE {} = ? ORDER BY updated DESC LIMIT 1",
        column
    ))?;
    optional(stmt.query_row(params![source_pid], |row| row.get(0)))
}

/// All VIAF pids claiming a source pid, for conflict detection
pub fn all_claiming(
    conn: &Connection,
    source: SourceName,
    source_pid: &str,
) -> Result<Vec<String>> {
    let column = match source {
        SourceName::Gnd => "gnd_pid",
        SourceName::Idref => "idref_pid",
        SourceName::Rero => "rero_pid",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT pid FROM viaf_records WHERE {} = ? ORDER BY updated DESC",
        column
    ))?;
    let pids = stmt
        .query_map(params![source_pid], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pids)
}

/// Iterate all VIAF records ordered by pid
pub fn iterate(conn: &Connection) -> Result<Vec<ViafRecord>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY pid", SELECT))?;
    let rows = stmt
        .query_map([], ViafRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Number of VIAF records
pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM viaf_records", [], |row| row.get(0))?)
}
