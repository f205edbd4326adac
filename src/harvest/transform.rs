//! MARC to normalized payload transformation
//!
//! Pure functions from a parsed MARC record to the kind's JSON payload.
//! Dispatch is over the closed kind enumeration.

use serde_json::{json, Map, Value};

use super::marc::MarcRecord;
use crate::records::{RelationPid, RelationType};
use crate::types::{EntityKind, Family, MefError, Result};

/// Transformation output handed to the reconciliation engine
#[derive(Debug, Clone)]
pub struct TransformedRecord {
    pub pid: String,
    pub payload: Value,
    /// Leader status indicates the record is withdrawn
    pub deleted: bool,
    /// Source-declared redirect, when the leader marks a replacement
    pub relation: Option<RelationPid>,
}

/// Leader status characters meaning the record was withdrawn or replaced
fn status_deleted(marc: &MarcRecord) -> bool {
    matches!(marc.status(), Some('d') | Some('x'))
}

/// Transform one MARC record into the kind's normalized payload.
///
/// `fallback_pid` covers records whose 001 is absent (deleted stubs);
/// harvesters pass the OAI identifier tail.
pub fn transform(
    kind: EntityKind,
    marc: &MarcRecord,
    fallback_pid: Option<&str>,
) -> Result<TransformedRecord> {
    let pid = marc
        .controlfield("001")
        .map(str::to_string)
        .or_else(|| fallback_pid.map(str::to_string))
        .ok_or_else(|| {
            MefError::Validation(format!("{}: record carries no identifier", kind))
        })?;

    let deleted = status_deleted(marc);
    let relation = redirect_target(marc).map(|value| RelationPid {
        relation: RelationType::RedirectTo,
        value,
    });

    let mut payload = Map::new();
    payload.insert("pid".into(), json!(pid));

    if let Some(record_type) = record_type(kind.family(), marc) {
        payload.insert("type".into(), json!(record_type));
    }
    if let Some(aap) = authorized_access_point(kind.family(), marc) {
        payload.insert("authorized_access_point".into(), json!(aap));
    }

    let identified_by = identified_by(marc);
    if !identified_by.is_empty() {
        payload.insert("identifiedBy".into(), Value::Array(identified_by));
    }

    Ok(TransformedRecord {
        pid,
        payload: Value::Object(payload),
        deleted,
        relation,
    })
}

/// Successor pid from 682 $0, stripping any `(agency)` prefix.
/// GND marks replaced records this way.
fn redirect_target(marc: &MarcRecord) -> Option<String> {
    let value = marc.subfield("682", "0")?;
    let stripped = match value.find(')') {
        Some(pos) if value.starts_with('(') => &value[pos + 1..],
        _ => value,
    };
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

fn record_type(family: Family, marc: &MarcRecord) -> Option<&'static str> {
    match family {
        Family::Agent => {
            if marc.datafield("100").is_some() {
                Some("bf:Person")
            } else if marc.datafield("110").is_some() || marc.datafield("111").is_some() {
                Some("bf:Organisation")
            } else {
                None
            }
        }
        Family::Concept => marc.datafield("150").map(|_| "bf:Topic"),
        Family::Place => marc.datafield("151").map(|_| "bf:Place"),
    }
}

/// The canonical display string, from the family's heading field
fn authorized_access_point(family: Family, marc: &MarcRecord) -> Option<String> {
    let tags: &[&str] = match family {
        Family::Agent => &["100", "110", "111", "130"],
        Family::Concept => &["150"],
        Family::Place => &["151"],
    };
    for tag in tags {
        if let Some(field) = marc.datafield(tag) {
            let parts: Vec<&str> = ["a", "b", "c", "d"]
                .iter()
                .filter_map(|code| field.subfield(*code))
                .collect();
            if !parts.is_empty() {
                return Some(parts.join(", "));
            }
        }
    }
    None
}

/// `identifiedBy` entries from 035 $a, mapping known agency prefixes
fn identified_by(marc: &MarcRecord) -> Vec<Value> {
    let mut entries = Vec::new();
    for field in marc.datafields_with_tag("035") {
        for value in field.subfields_with_code("a") {
            let source = if value.starts_with("(DE-101)") {
                "GND"
            } else if value.starts_with("(IDREF)") {
                "IDREF"
            } else if value.starts_with("(RERO)") {
                "RERO"
            } else if value.starts_with("(VIAF)") {
                "VIAF"
            } else {
                "other"
            };
            entries.push(json!({"source": source, "value": value}));
        }
    }
    entries
}
