//! Source record store
//!
//! One versioned record per `(kind, source_pid)` with its normalized payload,
//! checksum and deletion flag. Writes are transactional with pid
//! registration; callers run them inside a `Db::transaction`.

use rusqlite::{params, Connection, Row};
use serde_json::Value;
use tracing::debug;

use super::{checksum, validate, PutAction, RecordMeta, RelationPid, RelationType};
use crate::db::optional;
use crate::pid;
use crate::types::{now_rfc3339, EntityKind, MefError, Result, Role, SourceName};

/// A normalized authority record as issued by one provider
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub kind: EntityKind,
    pub pid: String,
    pub payload: Value,
    pub md5: String,
    /// Logical deletion timestamp; payload is retained
    pub deleted: Option<String>,
    /// The source's own redirect declaration, if any
    pub relation_pid: Option<RelationPid>,
    pub meta: RecordMeta,
}

impl SourceRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get("kind")?;
        let kind: EntityKind = kind_str.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "kind".into(), rusqlite::types::Type::Text)
        })?;
        let payload_str: String = row.get("payload")?;
        let payload: Value = serde_json::from_str(&payload_str).map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "payload".into(), rusqlite::types::Type::Text)
        })?;
        let relation_type: Option<String> = row.get("relation_type")?;
        let relation_value: Option<String> = row.get("relation_value")?;
        let relation_pid = match (relation_type, relation_value) {
            (Some(t), Some(v)) => RelationType::parse(&t).ok().map(|relation| RelationPid {
                relation,
                value: v,
            }),
            _ => None,
        };
        Ok(Self {
            kind,
            pid: row.get("pid")?,
            payload,
            md5: row.get("md5")?,
            deleted: row.get("deleted")?,
            relation_pid,
            meta: RecordMeta::from_row(row)?,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// The GND pid this record asserts equivalence with, from an
    /// `identifiedBy` entry of the form `(DE-101)<pid>`.
    pub fn gnd_equivalence(&self) -> Option<String> {
        gnd_equivalence(&self.payload)
    }
}

/// Extract a `(DE-101)`-prefixed GND equivalence from a payload
pub fn gnd_equivalence(payload: &Value) -> Option<String> {
    let entries = payload.get("identifiedBy")?.as_array()?;
    for entry in entries {
        let value = entry.get("value").and_then(Value::as_str)?;
        if let Some(gnd_pid) = value.strip_prefix("(DE-101)") {
            if !gnd_pid.is_empty() {
                return Some(gnd_pid.to_string());
            }
        }
    }
    None
}

const SELECT: &str = "SELECT kind, pid, uuid, payload, md5, deleted, relation_type, \
                      relation_value, created, updated, version FROM source_records";

fn require_source(kind: EntityKind) -> Result<()> {
    if kind.role() != Role::Source {
        return Err(MefError::Internal(format!(
            "Source store holds source kinds only, got {}",
            kind
        )));
    }
    Ok(())
}

/// Store or refresh a record.
///
/// Computes the checksum, validates the payload, registers the pid in the
/// same transaction, and applies the source-declared redirect if present.
/// Returns `Unchanged` when payload, deletion flag and relation all match
/// the stored state.
pub fn put(
    conn: &Connection,
    kind: EntityKind,
    record_pid: &str,
    payload: &Value,
    deleted: Option<&str>,
    relation: Option<&RelationPid>,
) -> Result<PutAction> {
    require_source(kind)?;
    validate::validate(kind, record_pid, payload)?;

    let md5 = checksum(payload)?;
    let existing = get(conn, kind, record_pid)?;

    let action = match existing {
        Some(ref current)
            if current.md5 == md5
                && current.deleted.is_some() == deleted.is_some()
                && current.relation_pid.as_ref() == relation =>
        {
            PutAction::Unchanged
        }
        Some(current) => {
            conn.execute(
                "UPDATE source_records
                 SET payload = ?, md5 = ?, deleted = ?, relation_type = ?,
                     relation_value = ?, updated = ?, version = version + 1
                 WHERE kind = ? AND pid = ?",
                params![
                    serde_json::to_string(payload)?,
                    md5,
                    deleted,
                    relation.map(|r| r.relation.as_str()),
                    relation.map(|r| r.value.as_str()),
                    now_rfc3339(),
                    kind.as_str(),
                    record_pid
                ],
            )?;
            debug!(kind = %kind, pid = %record_pid, was_deleted = current.is_deleted(), "Updated source record");
            PutAction::Updated
        }
        None => {
            let meta = RecordMeta::new();
            conn.execute(
                "INSERT INTO source_records
                 (kind, pid, uuid, payload, md5, deleted, relation_type, relation_value,
                  created, updated, version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
                params![
                    kind.as_str(),
                    record_pid,
                    meta.uuid,
                    serde_json::to_string(payload)?,
                    md5,
                    deleted,
                    relation.map(|r| r.relation.as_str()),
                    relation.map(|r| r.value.as_str()),
                    meta.created,
                    meta.updated
                ],
            )?;
            debug!(kind = %kind, pid = %record_pid, "Created source record");
            PutAction::Created
        }
    };

    pid::register(conn, kind, record_pid)?;
    if deleted.is_some() {
        pid::mark_deleted(conn, kind, record_pid)?;
    } else {
        pid::reactivate(conn, kind, record_pid)?;
    }
    if let Some(rel) = relation {
        if rel.relation == RelationType::RedirectTo {
            pid::redirect(conn, kind, record_pid, &rel.value)?;
        }
    }

    Ok(action)
}

/// Get a record, deleted or not
pub fn get(conn: &Connection, kind: EntityKind, record_pid: &str) -> Result<Option<SourceRecord>> {
    require_source(kind)?;
    let mut stmt = conn.prepare(&format!("{} WHERE kind = ? AND pid = ?", SELECT))?;
    optional(stmt.query_row(params![kind.as_str(), record_pid], SourceRecord::from_row))
}

/// Set the logical deletion timestamp. Returns false when the record is unknown.
pub fn mark_deleted(conn: &Connection, kind: EntityKind, record_pid: &str) -> Result<bool> {
    require_source(kind)?;
    let changed = conn.execute(
        "UPDATE source_records SET deleted = ?, updated = ?, version = version + 1
         WHERE kind = ? AND pid = ? AND deleted IS NULL",
        params![now_rfc3339(), now_rfc3339(), kind.as_str(), record_pid],
    )?;
    if changed > 0 {
        pid::mark_deleted(conn, kind, record_pid)?;
    }
    Ok(changed > 0)
}

/// Iterate records of a kind, optionally only those updated since `since`
pub fn iterate(
    conn: &Connection,
    kind: EntityKind,
    since: Option<&str>,
) -> Result<Vec<SourceRecord>> {
    require_source(kind)?;
    let rows = match since {
        Some(ts) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE kind = ? AND updated >= ? ORDER BY pid",
                SELECT
            ))?;
            let rows = stmt
                .query_map(params![kind.as_str(), ts], SourceRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} WHERE kind = ? ORDER BY pid", SELECT))?;
            let rows = stmt
                .query_map(params![kind.as_str()], SourceRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Find an IDREF record that declares `redirect_from` the given pid.
///
/// IDREF publishes successor records pointing back at their predecessor;
/// `latest` follows those declarations forward.
pub fn find_redirect_from(
    conn: &Connection,
    kind: EntityKind,
    record_pid: &str,
) -> Result<Option<String>> {
    require_source(kind)?;
    if kind.source() != Some(SourceName::Idref) {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT pid FROM source_records
         WHERE kind = ? AND relation_type = 'redirect_from' AND relation_value = ?
         ORDER BY updated DESC LIMIT 1",
    )?;
    optional(stmt.query_row(params![kind.as_str(), record_pid], |row| row.get(0)))
}

/// Find a live IDREF record asserting GND equivalence with `gnd_pid`.
///
/// Candidates are narrowed with a payload LIKE scan, then verified against
/// the parsed `identifiedBy` entries.
pub fn find_gnd_equivalent(
    conn: &Connection,
    kind: EntityKind,
    gnd_pid: &str,
) -> Result<Option<String>> {
    require_source(kind)?;
    let pattern = format!("%(DE-101){}%", gnd_pid);
    let mut stmt = conn.prepare(&format!(
        "{} WHERE kind = ? AND deleted IS NULL AND payload LIKE ? ORDER BY updated DESC",
        SELECT
    ))?;
    let candidates = stmt
        .query_map(params![kind.as_str(), pattern], SourceRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for candidate in candidates {
        if candidate.gnd_equivalence().as_deref() == Some(gnd_pid) {
            return Ok(Some(candidate.pid));
        }
    }
    Ok(None)
}

/// Count records of a kind; `live_only` excludes logically deleted ones
pub fn count(conn: &Connection, kind: EntityKind, live_only: bool) -> Result<i64> {
    require_source(kind)?;
    let sql = if live_only {
        "SELECT COUNT(*) FROM source_records WHERE kind = ? AND deleted IS NULL"
    } else {
        "SELECT COUNT(*) FROM source_records WHERE kind = ?"
    };
    Ok(conn.query_row(sql, params![kind.as_str()], |row| row.get(0))?)
}

/// Live pids of a kind
pub fn live_pids(conn: &Connection, kind: EntityKind) -> Result<Vec<String>> {
    require_source(kind)?;
    let mut stmt = conn.prepare(
        "SELECT pid FROM source_records WHERE kind = ? AND deleted IS NULL ORDER BY pid",
    )?;
    let pids = stmt
        .query_map(params![kind.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pids)
}

/// Physically remove a record. Manual purges only; the pid row stays.
pub fn purge(conn: &Connection, kind: EntityKind, record_pid: &str) -> Result<bool> {
    require_source(kind)?;
    let changed = conn.execute(
        "DELETE FROM source_records WHERE kind = ? AND pid = ?",
        params![kind.as_str(), record_pid],
    )?;
    Ok(changed > 0)
}
