//! Direct single-record endpoints
//!
//! On-demand fetch of one raw record: SRU for GND, OAI `GetRecord` for
//! IDREF, a MARCXML endpoint for RERO, and the VIAF JSON sourceID lookup.

use serde_json::Value;
use tracing::debug;

use super::marc::{parse_marcxml, MarcRecord};
use super::oai::{OaiClient, OaiEndpoint};
use crate::records::viaf::ViafRecord;
use crate::types::{MefError, Result, SourceName};

/// Endpoint coordinates for direct lookups
#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub gnd_sru_url: String,
    pub idref_oai_url: String,
    pub rero_marcxml_url: String,
    pub viaf_url: String,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            gnd_sru_url: "https://services.dnb.de/sru/authorities".into(),
            idref_oai_url: "https://www.idref.fr/OAI/oai.jsp".into(),
            rero_marcxml_url: "https://bib.rero.ch/api/export".into(),
            viaf_url: "https://viaf.org/viaf".into(),
        }
    }
}

/// VIAF's source labels for our providers
fn viaf_source_code(source: SourceName) -> &'static str {
    match source {
        SourceName::Gnd => "DNB",
        SourceName::Idref => "SUDOC",
        SourceName::Rero => "RERO",
    }
}

/// Fetch one raw source record as MARC
pub async fn fetch_source(
    client: &OaiClient,
    config: &DirectConfig,
    source: SourceName,
    pid: &str,
) -> Result<Option<MarcRecord>> {
    let body = match source {
        SourceName::Gnd => {
            let url = format!(
                "{}?version=1.1&operation=searchRetrieve&query=idn%3D{}&recordSchema=MARC21-xml",
                config.gnd_sru_url, pid
            );
            client.fetch(&url).await?
        }
        SourceName::Idref => {
            let endpoint = OaiEndpoint {
                base_url: config.idref_oai_url.clone(),
                metadata_prefix: "marc21".into(),
                set_spec: None,
                access_token: None,
            };
            match client.get_record(&endpoint, pid).await? {
                Some(record) => return Ok(record.marc),
                None => return Ok(None),
            }
        }
        SourceName::Rero => {
            let url = format!("{}/{}.xml", config.rero_marcxml_url, pid);
            client.fetch(&url).await?
        }
    };

    match parse_marcxml(&body) {
        Ok(record) => Ok(Some(record)),
        Err(MefError::Validation(msg)) => {
            debug!(source = %source, pid = %pid, "{}", msg);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// VIAF sourceID lookup: the cross-walk record claiming `(source, pid)`
pub async fn fetch_viaf_by_source(
    client: &OaiClient,
    config: &DirectConfig,
    source: SourceName,
    pid: &str,
) -> Result<Option<ViafRecord>> {
    let url = format!(
        "{}/sourceID/{}%7C{}/viaf.json",
        config.viaf_url,
        viaf_source_code(source),
        pid
    );
    let body = client.fetch(&url).await?;
    let json: Value = serde_json::from_str(&body)
        .map_err(|e| MefError::Http(format!("VIAF response is not JSON: {}", e)))?;
    Ok(parse_viaf_json(&json))
}

/// Pull the cluster id and per-source membership out of a VIAF JSON document
pub fn parse_viaf_json(json: &Value) -> Option<ViafRecord> {
    let viaf_pid = json
        .get("viafID")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })?;

    let mut record = ViafRecord::new(&viaf_pid, None, None, None);
    if let Some(sources) = json.get("sources").and_then(|s| s.get("source")) {
        let entries: Vec<&Value> = match sources {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        for entry in entries {
            let text = entry
                .get("#text")
                .and_then(Value::as_str)
                .or_else(|| entry.as_str());
            let Some(text) = text else { continue };
            let Some((code, source_pid)) = text.split_once('|') else {
                continue;
            };
            let source = match code {
                "DNB" => SourceName::Gnd,
                "SUDOC" => SourceName::Idref,
                "RERO" => SourceName::Rero,
                _ => continue,
            };
            record.set_source_pid(source, Some(source_pid.trim().to_string()));
        }
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_viaf_json() {
        let doc = json!({
            "viafID": "66739143",
            "sources": {
                "source": [
                    {"#text": "DNB|12391664X"},
                    {"#text": "SUDOC|069774331"},
                    {"#text": "RERO|A023655346"},
                    {"#text": "LC|n12345"},
                ]
            }
        });
        let record = parse_viaf_json(&doc).unwrap();
        assert_eq!(record.pid, "66739143");
        assert_eq!(record.gnd_pid.as_deref(), Some("12391664X"));
        assert_eq!(record.idref_pid.as_deref(), Some("069774331"));
        assert_eq!(record.rero_pid.as_deref(), Some("A023655346"));
    }

    #[test]
    fn test_parse_viaf_json_single_source() {
        let doc = json!({
            "viafID": 66739143,
            "sources": {"source": {"#text": "DNB|12391664X"}}
        });
        let record = parse_viaf_json(&doc).unwrap();
        assert_eq!(record.pid, "66739143");
        assert_eq!(record.gnd_pid.as_deref(), Some("12391664X"));
        assert!(record.idref_pid.is_none());
    }

    #[test]
    fn test_parse_viaf_json_without_id() {
        assert!(parse_viaf_json(&json!({"sources": {}})).is_none());
    }
}
