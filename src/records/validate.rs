//! Per-kind payload validators
//!
//! Source kinds are a closed enumeration, so validation dispatches over
//! tagged variants instead of runtime-discovered schemas. A violation fails
//! the event with no side effects.

use serde_json::Value;

use crate::types::{EntityKind, Family, MefError, Result, Role};

/// Allowed `type` values per family
fn allowed_types(family: Family) -> &'static [&'static str] {
    match family {
        Family::Agent => &["bf:Person", "bf:Organisation"],
        Family::Concept => &["bf:Topic", "bf:Temporal"],
        Family::Place => &["bf:Place"],
    }
}

/// Validate a normalized payload against its kind's schema
pub fn validate(kind: EntityKind, pid: &str, payload: &Value) -> Result<()> {
    if kind.role() != Role::Source {
        return Err(MefError::Internal(format!(
            "Validation applies to source kinds, got {}",
            kind
        )));
    }

    let obj = payload.as_object().ok_or_else(|| {
        MefError::Validation(format!("{} {}: payload is not an object", kind, pid))
    })?;

    if let Some(payload_pid) = obj.get("pid") {
        let payload_pid = payload_pid.as_str().ok_or_else(|| {
            MefError::Validation(format!("{} {}: pid is not a string", kind, pid))
        })?;
        if payload_pid != pid {
            return Err(MefError::Validation(format!(
                "{} {}: payload pid '{}' does not match record pid",
                kind, pid, payload_pid
            )));
        }
    }

    if let Some(aap) = obj.get("authorized_access_point") {
        match aap.as_str() {
            Some(s) if !s.is_empty() => {}
            _ => {
                return Err(MefError::Validation(format!(
                    "{} {}: authorized_access_point must be a non-empty string",
                    kind, pid
                )))
            }
        }
    }

    if let Some(record_type) = obj.get("type") {
        let record_type = record_type.as_str().ok_or_else(|| {
            MefError::Validation(format!("{} {}: type is not a string", kind, pid))
        })?;
        if !allowed_types(kind.family()).contains(&record_type) {
            return Err(MefError::Validation(format!(
                "{} {}: type '{}' not allowed for family {}",
                kind,
                pid,
                record_type,
                kind.family()
            )));
        }
    }

    if let Some(identified_by) = obj.get("identifiedBy") {
        let entries = identified_by.as_array().ok_or_else(|| {
            MefError::Validation(format!("{} {}: identifiedBy is not an array", kind, pid))
        })?;
        for entry in entries {
            let entry = entry.as_object().ok_or_else(|| {
                MefError::Validation(format!(
                    "{} {}: identifiedBy entry is not an object",
                    kind, pid
                ))
            })?;
            if entry.get("value").and_then(Value::as_str).is_none() {
                return Err(MefError::Validation(format!(
                    "{} {}: identifiedBy entry has no string value",
                    kind, pid
                )));
            }
        }
    }

    Ok(())
}
