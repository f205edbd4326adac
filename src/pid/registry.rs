//! Registry operations over the pids and id_counters tables

use std::collections::HashSet;

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::db::optional;
use crate::types::{now_rfc3339, EntityKind, Family, MefError, Result, MAX_REDIRECT_DEPTH};

/// Lifecycle status of a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PidStatus {
    Registered,
    Redirected,
    Deleted,
}

impl PidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PidStatus::Registered => "registered",
            PidStatus::Redirected => "redirected",
            PidStatus::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "registered" => Ok(PidStatus::Registered),
            "redirected" => Ok(PidStatus::Redirected),
            "deleted" => Ok(PidStatus::Deleted),
            other => Err(MefError::Internal(format!("Unknown pid status: {}", other))),
        }
    }
}

/// One pid row
#[derive(Debug, Clone, Serialize)]
pub struct PidRow {
    pub kind: EntityKind,
    pub value: String,
    pub status: PidStatus,
    /// Redirect target, same kind, set only when status is `redirected`
    pub target: Option<String>,
    pub object_uuid: String,
    pub created: String,
    pub updated: String,
}

impl PidRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get("kind")?;
        let status_str: String = row.get("status")?;
        let kind: EntityKind = kind_str.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "kind".into(), rusqlite::types::Type::Text)
        })?;
        let status = PidStatus::parse(&status_str).map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text)
        })?;
        Ok(Self {
            kind,
            value: row.get("value")?,
            status,
            target: row.get("target")?,
            object_uuid: row.get("object_uuid")?,
            created: row.get("created")?,
            updated: row.get("updated")?,
        })
    }
}

const SELECT: &str =
    "SELECT kind, value, status, target, object_uuid, created, updated FROM pids";

/// Get a pid row without following redirects
pub fn get(conn: &Connection, kind: EntityKind, value: &str) -> Result<Option<PidRow>> {
    let mut stmt = conn.prepare(&format!("{} WHERE kind = ? AND value = ?", SELECT))?;
    optional(stmt.query_row(params![kind.as_str(), value], PidRow::from_row))
}

/// Register a source- or VIAF-assigned pid. Idempotent.
pub fn register(conn: &Connection, kind: EntityKind, value: &str) -> Result<PidRow> {
    if let Some(existing) = get(conn, kind, value)? {
        return Ok(existing);
    }

    let now = now_rfc3339();
    let row = PidRow {
        kind,
        value: value.to_string(),
        status: PidStatus::Registered,
        target: None,
        object_uuid: Uuid::new_v4().to_string(),
        created: now.clone(),
        updated: now,
    };
    conn.execute(
        "INSERT INTO pids (kind, value, status, target, object_uuid, created, updated)
         VALUES (?, ?, 'registered', NULL, ?, ?, ?)",
        params![
            row.kind.as_str(),
            row.value,
            row.object_uuid,
            row.created,
            row.updated
        ],
    )?;
    debug!(kind = %kind, pid = %value, "Registered pid");
    Ok(row)
}

/// Mint the next MEF pid for a family from its monotonic counter
pub fn mint(conn: &Connection, family: Family) -> Result<String> {
    conn.execute(
        "INSERT INTO id_counters (family, next) VALUES (?, 1)
         ON CONFLICT(family) DO NOTHING",
        params![family.as_str()],
    )?;
    let next: i64 = conn.query_row(
        "SELECT next FROM id_counters WHERE family = ?",
        params![family.as_str()],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE id_counters SET next = next + 1 WHERE family = ?",
        params![family.as_str()],
    )?;

    let value = next.to_string();
    register(conn, family.mef_kind(), &value)?;
    Ok(value)
}

/// Resolve a pid to its terminal row, following redirects.
///
/// Chains are bounded by `MAX_REDIRECT_DEPTH` and guarded with a visited
/// set; a cycle or an over-long chain is a `Conflict`.
pub fn resolve(conn: &Connection, kind: EntityKind, value: &str) -> Result<PidRow> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = value.to_string();

    for _ in 0..=MAX_REDIRECT_DEPTH {
        if !visited.insert(current.clone()) {
            return Err(MefError::Conflict(format!(
                "Redirect cycle at {} {}",
                kind, current
            )));
        }
        let row = get(conn, kind, &current)?.ok_or_else(|| {
            MefError::NotFound(format!("Pid {} {} does not exist", kind, current))
        })?;
        match (&row.status, &row.target) {
            (PidStatus::Redirected, Some(target)) => current = target.clone(),
            _ => return Ok(row),
        }
    }

    Err(MefError::Conflict(format!(
        "Redirect chain longer than {} at {} {}",
        MAX_REDIRECT_DEPTH, kind, value
    )))
}

/// Redirect `from` to `to` within one kind.
///
/// Rejects self-redirects and writes that would close a cycle. The target is
/// registered if it does not exist yet.
pub fn redirect(conn: &Connection, kind: EntityKind, from: &str, to: &str) -> Result<()> {
    if from == to {
        return Err(MefError::Conflict(format!(
            "Self-redirect rejected for {} {}",
            kind, from
        )));
    }

    register(conn, kind, from)?;
    register(conn, kind, to)?;

    // Walk the target chain; reaching `from` again would close a cycle
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = to.to_string();
    for _ in 0..=MAX_REDIRECT_DEPTH {
        if current == from {
            return Err(MefError::Conflict(format!(
                "Redirect {} -> {} would create a cycle in {}",
                from, to, kind
            )));
        }
        if !visited.insert(current.clone()) {
            return Err(MefError::Conflict(format!(
                "Existing redirect cycle at {} {}",
                kind, current
            )));
        }
        match get(conn, kind, &current)? {
            Some(row) if row.status == PidStatus::Redirected => match row.target {
                Some(t) => current = t,
                None => break,
            },
            _ => break,
        }
    }

    conn.execute(
        "UPDATE pids SET status = 'redirected', target = ?, updated = ?
         WHERE kind = ? AND value = ?",
        params![to, now_rfc3339(), kind.as_str(), from],
    )?;
    debug!(kind = %kind, from = %from, to = %to, "Redirected pid");
    Ok(())
}

/// Return a deleted pid to `registered`, for records that reappear
/// upstream. Redirected pids are left alone.
pub fn reactivate(conn: &Connection, kind: EntityKind, value: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pids SET status = 'registered', updated = ?
         WHERE kind = ? AND value = ? AND status = 'deleted'",
        params![now_rfc3339(), kind.as_str(), value],
    )?;
    Ok(changed > 0)
}

/// Mark a pid deleted. Returns false when the pid is unknown.
pub fn mark_deleted(conn: &Connection, kind: EntityKind, value: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE pids SET status = 'deleted', updated = ? WHERE kind = ? AND value = ?",
        params![now_rfc3339(), kind.as_str(), value],
    )?;
    Ok(changed > 0)
}

/// List pids of a kind, optionally only those updated since `since`
pub fn list(conn: &Connection, kind: EntityKind, since: Option<&str>) -> Result<Vec<PidRow>> {
    let rows = match since {
        Some(ts) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE kind = ? AND updated >= ? ORDER BY value",
                SELECT
            ))?;
            let rows = stmt
                .query_map(params![kind.as_str(), ts], PidRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare(&format!("{} WHERE kind = ? ORDER BY value", SELECT))?;
            let rows = stmt
                .query_map(params![kind.as_str()], PidRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_register_idempotent() {
        let db = test_db().await;
        db.read(|conn| {
            let a = register(conn, EntityKind::AgentGnd, "118540238")?;
            let b = register(conn, EntityKind::AgentGnd, "118540238")?;
            assert_eq!(a.object_uuid, b.object_uuid);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_mint_monotonic_per_family() {
        let db = test_db().await;
        db.read(|conn| {
            assert_eq!(mint(conn, Family::Agent)?, "1");
            assert_eq!(mint(conn, Family::Agent)?, "2");
            // Families count independently
            assert_eq!(mint(conn, Family::Place)?, "1");
            assert_eq!(mint(conn, Family::Agent)?, "3");
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_follows_chain() {
        let db = test_db().await;
        db.read(|conn| {
            register(conn, EntityKind::AgentIdref, "a")?;
            redirect(conn, EntityKind::AgentIdref, "a", "b")?;
            redirect(conn, EntityKind::AgentIdref, "b", "c")?;

            let terminal = resolve(conn, EntityKind::AgentIdref, "a")?;
            assert_eq!(terminal.value, "c");
            assert_eq!(terminal.status, PidStatus::Registered);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_redirect_cycle_rejected() {
        let db = test_db().await;
        db.read(|conn| {
            redirect(conn, EntityKind::AgentIdref, "a", "b")?;
            redirect(conn, EntityKind::AgentIdref, "b", "c")?;

            let err = redirect(conn, EntityKind::AgentIdref, "c", "a").unwrap_err();
            assert!(matches!(err, MefError::Conflict(_)));

            let err = redirect(conn, EntityKind::AgentIdref, "a", "a").unwrap_err();
            assert!(matches!(err, MefError::Conflict(_)));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_not_found() {
        let db = test_db().await;
        db.read(|conn| {
            let err = resolve(conn, EntityKind::AgentGnd, "nope").unwrap_err();
            assert!(matches!(err, MefError::NotFound(_)));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_mark_deleted_and_list() {
        let db = test_db().await;
        db.read(|conn| {
            register(conn, EntityKind::AgentRero, "r1")?;
            register(conn, EntityKind::AgentRero, "r2")?;
            assert!(mark_deleted(conn, EntityKind::AgentRero, "r1")?);
            assert!(!mark_deleted(conn, EntityKind::AgentRero, "r9")?);

            let all = list(conn, EntityKind::AgentRero, None)?;
            assert_eq!(all.len(), 2);
            assert_eq!(all[0].status, PidStatus::Deleted);
            Ok(())
        })
        .await
        .unwrap();
    }
}
