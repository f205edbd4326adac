//! MARCXML parsing
//!
//! Streaming reader over the MARC slim schema: one leader, controlfields
//! keyed by tag, datafields with indicators and coded subfields. Namespace
//! prefixes are ignored; only local names matter.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::types::{MefError, Result};

/// A parsed MARC record
#[derive(Debug, Clone, Default)]
pub struct MarcRecord {
    pub leader: String,
    pub controlfields: Vec<ControlField>,
    pub datafields: Vec<DataField>,
}

#[derive(Debug, Clone)]
pub struct ControlField {
    pub tag: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct DataField {
    pub tag: String,
    pub ind1: String,
    pub ind2: String,
    pub subfields: Vec<Subfield>,
}

#[derive(Debug, Clone)]
pub struct Subfield {
    pub code: String,
    pub value: String,
}

impl MarcRecord {
    pub fn is_empty(&self) -> bool {
        self.leader.is_empty() && self.controlfields.is_empty() && self.datafields.is_empty()
    }

    pub fn controlfield(&self, tag: &str) -> Option<&str> {
        self.controlfields
            .iter()
            .find(|f| f.tag == tag)
            .map(|f| f.value.as_str())
    }

    pub fn datafield(&self, tag: &str) -> Option<&DataField> {
        self.datafields.iter().find(|f| f.tag == tag)
    }

    pub fn datafields_with_tag<'a>(
        &'a self,
        tag: &'a str,
    ) -> impl Iterator<Item = &'a DataField> + 'a {
        self.datafields.iter().filter(move |f| f.tag == tag)
    }

    /// First subfield value for `(tag, code)`
    pub fn subfield(&self, tag: &str, code: &str) -> Option<&str> {
        self.datafield(tag).and_then(|f| f.subfield(code))
    }

    /// Record status character from the leader (position 5)
    pub fn status(&self) -> Option<char> {
        self.leader.chars().nth(5)
    }
}

impl DataField {
    pub fn subfield(&self, code: &str) -> Option<&str> {
        self.subfields
            .iter()
            .find(|s| s.code == code)
            .map(|s| s.value.as_str())
    }

    pub fn subfields_with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.subfields
            .iter()
            .filter(move |s| s.code == code)
            .map(|s| s.value.as_str())
    }
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| MefError::Validation(format!("Bad attribute: {}", err)))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| MefError::Validation(format!("Bad attribute value: {}", err)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parse the first MARC record found in `xml`.
///
/// Works both on plain MARCXML and on envelopes (SRU responses) where the
/// MARC record is nested inside transport elements: the record boundary is
/// the closing `record` element after MARC fields were seen.
pub fn parse_marcxml(xml: &str) -> Result<MarcRecord> {
    let mut reader = Reader::from_str(xml);
    let mut record = MarcRecord::default();
    let mut seen_fields = false;

    let mut current_text = String::new();
    let mut current_control: Option<String> = None;
    let mut current_data: Option<DataField> = None;
    let mut current_subfield: Option<String> = None;
    let mut in_leader = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"leader" => {
                    in_leader = true;
                    current_text.clear();
                }
                b"controlfield" => {
                    current_control = attr_value(&e, b"tag")?;
                    current_text.clear();
                }
                b"datafield" => {
                    current_data = Some(DataField {
                        tag: attr_value(&e, b"tag")?.unwrap_or_default(),
                        ind1: attr_value(&e, b"ind1")?.unwrap_or_default(),
                        ind2: attr_value(&e, b"ind2")?.unwrap_or_default(),
                        subfields: Vec::new(),
                    });
                }
                b"subfield" => {
                    current_subfield = attr_value(&e, b"code")?;
                    current_text.clear();
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|err| MefError::Validation(format!("Bad text content: {}", err)))?;
                current_text.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"leader" => {
                    if in_leader {
                        record.leader = current_text.trim().to_string();
                        in_leader = false;
                        seen_fields = true;
                    }
                }
                b"controlfield" => {
                    if let Some(tag) = current_control.take() {
                        record.controlfields.push(ControlField {
                            tag,
                            value: current_text.trim().to_string(),
                        });
                        seen_fields = true;
                    }
                }
                b"subfield" => {
                    if let (Some(code), Some(data)) =
                        (current_subfield.take(), current_data.as_mut())
                    {
                        data.subfields.push(Subfield {
                            code,
                            value: current_text.trim().to_string(),
                        });
                    }
                }
                b"datafield" => {
                    if let Some(data) = current_data.take() {
                        record.datafields.push(data);
                        seen_fields = true;
                    }
                }
                b"record" => {
                    if seen_fields {
                        return Ok(record);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(MefError::Validation(format!("MARCXML parse error: {}", e)))
            }
        }
    }

    if seen_fields {
        Ok(record)
    } else {
        Err(MefError::Validation("No MARC record in document".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<record xmlns="http://www.loc.gov/MARC21/slim">
  <leader>00000nz  a2200000oc 4500</leader>
  <controlfield tag="001">12391664X</controlfield>
  <controlfield tag="003">DE-101</controlfield>
  <datafield tag="035" ind1=" " ind2=" ">
    <subfield code="a">(DE-101)12391664X</subfield>
  </datafield>
  <datafield tag="100" ind1="1" ind2=" ">
    <subfield code="a">Mustermann, Max</subfield>
    <subfield code="d">1900-1980</subfield>
  </datafield>
</record>"#;

    #[test]
    fn test_parse_plain_record() {
        let record = parse_marcxml(SAMPLE).unwrap();
        assert_eq!(record.controlfield("001"), Some("12391664X"));
        assert_eq!(record.subfield("100", "a"), Some("Mustermann, Max"));
        assert_eq!(record.subfield("035", "a"), Some("(DE-101)12391664X"));
        assert_eq!(record.status(), Some('n'));
    }

    #[test]
    fn test_parse_sru_envelope() {
        let xml = format!(
            r#"<searchRetrieveResponse><records><record><recordData>{}</recordData></record></records></searchRetrieveResponse>"#,
            SAMPLE.trim_start_matches(r#"<?xml version="1.0" encoding="UTF-8"?>"#)
        );
        let record = parse_marcxml(&xml).unwrap();
        assert_eq!(record.controlfield("001"), Some("12391664X"));
    }

    #[test]
    fn test_no_record_is_error() {
        let err = parse_marcxml("<foo/>").unwrap_err();
        assert!(matches!(err, MefError::Validation(_)));
    }
}
