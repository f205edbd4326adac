//! Record stores: source records, VIAF cross-walks, MEF clusters

pub mod mef;
pub mod source;
pub mod validate;
pub mod viaf;

use md5::{Digest, Md5};
use rusqlite::Row;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::types::{now_rfc3339, MefError, Result};

/// Row metadata shared by all record tables
#[derive(Debug, Clone, Serialize)]
pub struct RecordMeta {
    pub uuid: String,
    pub created: String,
    pub updated: String,
    pub version: i64,
}

impl RecordMeta {
    /// Fresh metadata with current timestamps
    pub fn new() -> Self {
        let now = now_rfc3339();
        Self {
            uuid: Uuid::new_v4().to_string(),
            created: now.clone(),
            updated: now,
            version: 1,
        }
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get("uuid")?,
            created: row.get("created")?,
            updated: row.get("updated")?,
            version: row.get("version")?,
        })
    }
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PutAction {
    Created,
    Updated,
    Unchanged,
}

/// Direction of a source-declared pid relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    RedirectTo,
    RedirectFrom,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::RedirectTo => "redirect_to",
            RelationType::RedirectFrom => "redirect_from",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "redirect_to" => Ok(RelationType::RedirectTo),
            "redirect_from" => Ok(RelationType::RedirectFrom),
            other => Err(MefError::Internal(format!(
                "Unknown relation type: {}",
                other
            ))),
        }
    }
}

/// A source's own redirect declaration carried on its record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationPid {
    pub relation: RelationType,
    pub value: String,
}

/// Checksum of a payload, stable under key reordering.
///
/// serde_json maps are BTree-backed, so serialization is key-sorted at every
/// nesting level; the digest is the md5 of that canonical string.
pub fn checksum(payload: &Value) -> Result<String> {
    let canonical = serde_json::to_string(payload)?;
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
