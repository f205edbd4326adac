//! Index document rendering
//!
//! Inter-record links are `(kind, pid)` pairs everywhere inside the system;
//! `$ref` URLs are rendered only here, at the serialization boundary.

use serde_json::{json, Map, Value};

use crate::records::mef::MefCluster;
use crate::records::source::SourceRecord;
use crate::records::viaf::ViafRecord;

/// Render the document for a MEF cluster.
///
/// Shape: `{ pid, type?, viaf_pid?, <source>: {$ref}, deleted?, sources: [..] }`
pub fn mef_document(cluster: &MefCluster, base_url: &str) -> Value {
    let mut doc = Map::new();
    doc.insert("pid".into(), json!(cluster.pid));
    if let Some(record_type) = &cluster.record_type {
        doc.insert("type".into(), json!(record_type));
    }
    if let Some(viaf_pid) = &cluster.viaf_pid {
        doc.insert("viaf_pid".into(), json!(viaf_pid));
    }

    let mut sources = Vec::new();
    for (source, source_pid) in cluster.source_refs() {
        doc.insert(
            source.as_str().into(),
            json!({
                "$ref": format!(
                    "{}/{}/{}/{}",
                    base_url.trim_end_matches('/'),
                    cluster.family.as_str(),
                    source.as_str(),
                    source_pid
                )
            }),
        );
        sources.push(json!(source.as_str()));
    }
    doc.insert("sources".into(), Value::Array(sources));

    if let Some(deleted) = &cluster.deleted {
        doc.insert("deleted".into(), json!(deleted));
    }
    Value::Object(doc)
}

/// Render the document for a source record: the payload plus admin fields
pub fn source_document(record: &SourceRecord) -> Value {
    let mut doc = match &record.payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("payload".into(), other.clone());
            map
        }
    };
    doc.insert("pid".into(), json!(record.pid));
    doc.insert("md5".into(), json!(record.md5));
    if let Some(deleted) = &record.deleted {
        doc.insert("deleted".into(), json!(deleted));
    }
    Value::Object(doc)
}

/// Render the document for a VIAF cross-walk record
pub fn viaf_document(record: &ViafRecord) -> Value {
    let mut doc = Map::new();
    doc.insert("pid".into(), json!(record.pid));
    for (source, source_pid) in record.membership() {
        doc.insert(format!("{}_pid", source.as_str()), json!(source_pid));
    }
    Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordMeta;
    use crate::types::Family;

    #[test]
    fn test_mef_document_shape() {
        let cluster = MefCluster {
            family: Family::Agent,
            pid: "1".into(),
            viaf_pid: Some("66739143".into()),
            gnd_pid: Some("12391664X".into()),
            idref_pid: Some("069774331".into()),
            rero_pid: None,
            record_type: Some("bf:Person".into()),
            deleted: None,
            meta: RecordMeta::new(),
        };
        let doc = mef_document(&cluster, "https://mef.test/api");
        assert_eq!(doc["pid"], "1");
        assert_eq!(doc["type"], "bf:Person");
        assert_eq!(doc["viaf_pid"], "66739143");
        assert_eq!(
            doc["gnd"]["$ref"],
            "https://mef.test/api/agent/gnd/12391664X"
        );
        assert_eq!(doc["sources"], serde_json::json!(["gnd", "idref"]));
        assert!(doc.get("rero").is_none());
        assert!(doc.get("deleted").is_none());
    }

    #[test]
    fn test_viaf_document_shape() {
        let record = ViafRecord::new("v1", Some("g1".into()), None, Some("r1".into()));
        let doc = viaf_document(&record);
        assert_eq!(doc["pid"], "v1");
        assert_eq!(doc["gnd_pid"], "g1");
        assert_eq!(doc["rero_pid"], "r1");
        assert!(doc.get("idref_pid").is_none());
    }
}
