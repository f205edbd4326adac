//! Harvest cursor store
//!
//! One row per configured OAI source: endpoint coordinates plus the
//! `last_run` watermark. The watermark only advances after a window
//! completes without error, so failed windows are retried.

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tracing::info;

use crate::db::optional;
use crate::types::{EntityKind, MefError, Result};

/// Per-source harvest configuration and state
#[derive(Debug, Clone, Serialize)]
pub struct HarvestCursor {
    pub name: String,
    pub kind: EntityKind,
    pub base_url: String,
    pub metadata_prefix: String,
    pub set_spec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub last_run: Option<String>,
}

impl HarvestCursor {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get("kind")?;
        let kind: EntityKind = kind_str.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "kind".into(), rusqlite::types::Type::Text)
        })?;
        Ok(Self {
            name: row.get("name")?,
            kind,
            base_url: row.get("base_url")?,
            metadata_prefix: row.get("metadata_prefix")?,
            set_spec: row.get("set_spec")?,
            access_token: row.get("access_token")?,
            last_run: row.get("last_run")?,
        })
    }
}

const SELECT: &str = "SELECT name, kind, base_url, metadata_prefix, set_spec, access_token, \
                      last_run FROM harvest_cursors";

/// Insert or replace a cursor configuration, preserving `last_run`
pub fn save(conn: &Connection, cursor: &HarvestCursor) -> Result<()> {
    let existing_last_run: Option<String> = get(conn, &cursor.name)?.and_then(|c| c.last_run);
    conn.execute(
        "INSERT OR REPLACE INTO harvest_cursors
         (name, kind, base_url, metadata_prefix, set_spec, access_token, last_run)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            cursor.name,
            cursor.kind.as_str(),
            cursor.base_url,
            cursor.metadata_prefix,
            cursor.set_spec,
            cursor.access_token,
            cursor.last_run.clone().or(existing_last_run),
        ],
    )?;
    info!(name = %cursor.name, kind = %cursor.kind, "Saved harvest cursor");
    Ok(())
}

pub fn get(conn: &Connection, name: &str) -> Result<Option<HarvestCursor>> {
    let mut stmt = conn.prepare(&format!("{} WHERE name = ?", SELECT))?;
    optional(stmt.query_row(params![name], HarvestCursor::from_row))
}

pub fn require(conn: &Connection, name: &str) -> Result<HarvestCursor> {
    get(conn, name)?.ok_or_else(|| {
        MefError::Config(format!("No harvest cursor named '{}' is configured", name))
    })
}

pub fn list(conn: &Connection) -> Result<Vec<HarvestCursor>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY name", SELECT))?;
    let rows = stmt
        .query_map([], HarvestCursor::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Advance the watermark after a clean window
pub fn set_last_run(conn: &Connection, name: &str, last_run: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE harvest_cursors SET last_run = ? WHERE name = ?",
        params![last_run, name],
    )?;
    if changed == 0 {
        return Err(MefError::NotFound(format!(
            "Harvest cursor '{}' does not exist",
            name
        )));
    }
    Ok(())
}

/// Remove a cursor (teardown)
pub fn delete(conn: &Connection, name: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM harvest_cursors WHERE name = ?", params![name])?;
    Ok(changed > 0)
}
