//! OAI-PMH client
//!
//! `ListRecords` over date windows with resumption tokens, plus single
//! record `GetRecord`. Transient HTTP failures retry with jittered
//! exponential backoff honoring `Retry-After`.

use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use rand::Rng;
use tracing::{debug, warn};

use super::marc::{ControlField, DataField, MarcRecord, Subfield};
use crate::types::{MefError, Result};

/// HTTP retry ceiling
const MAX_HTTP_RETRIES: u32 = 5;
/// Base backoff delay
const BASE_BACKOFF_MS: u64 = 500;

/// One harvested record
#[derive(Debug, Clone)]
pub struct OaiRecord {
    pub identifier: String,
    pub datestamp: String,
    /// Header status="deleted"
    pub deleted: bool,
    pub marc: Option<MarcRecord>,
}

impl OaiRecord {
    /// Source pid: controlfield 001 when present, else the identifier tail
    pub fn source_pid(&self) -> Option<String> {
        if let Some(marc) = &self.marc {
            if let Some(pid) = marc.controlfield("001") {
                return Some(pid.to_string());
            }
        }
        self.identifier
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}

/// One `ListRecords` page
#[derive(Debug, Default)]
pub struct OaiPage {
    pub records: Vec<OaiRecord>,
    pub resumption_token: Option<String>,
}

/// OAI endpoint configuration, mirrored from the harvest cursor
#[derive(Debug, Clone)]
pub struct OaiEndpoint {
    pub base_url: String,
    pub metadata_prefix: String,
    pub set_spec: Option<String>,
    pub access_token: Option<String>,
}

/// Thin OAI-PMH client over reqwest
#[derive(Clone)]
pub struct OaiClient {
    http: reqwest::Client,
}

impl OaiClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("mef-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// One `ListRecords` request: either the first page of a window or the
    /// continuation for a resumption token.
    pub async fn list_records(
        &self,
        endpoint: &OaiEndpoint,
        from: &str,
        until: &str,
        resumption_token: Option<&str>,
    ) -> Result<OaiPage> {
        let mut params: Vec<(&str, String)> = vec![("verb", "ListRecords".into())];
        match resumption_token {
            Some(token) => params.push(("resumptionToken", token.to_string())),
            None => {
                params.push(("metadataPrefix", endpoint.metadata_prefix.clone()));
                params.push(("from", from.to_string()));
                params.push(("until", until.to_string()));
                if let Some(set) = &endpoint.set_spec {
                    params.push(("set", set.clone()));
                }
            }
        }
        if let Some(token) = &endpoint.access_token {
            params.push(("accessToken", token.clone()));
        }

        let body = self.get_with_retry(&endpoint.base_url, &params).await?;
        parse_oai_response(&body)
    }

    /// Single record by identifier
    pub async fn get_record(
        &self,
        endpoint: &OaiEndpoint,
        identifier: &str,
    ) -> Result<Option<OaiRecord>> {
        let params: Vec<(&str, String)> = vec![
            ("verb", "GetRecord".into()),
            ("metadataPrefix", endpoint.metadata_prefix.clone()),
            ("identifier", identifier.to_string()),
        ];
        let body = self.get_with_retry(&endpoint.base_url, &params).await?;
        let page = parse_oai_response(&body)?;
        Ok(page.records.into_iter().next())
    }

    /// Plain GET returning the body, shared with the direct endpoints
    pub async fn fetch(&self, url: &str) -> Result<String> {
        self.get_with_retry(url, &[]).await
    }

    async fn get_with_retry(&self, url: &str, params: &[(&str, String)]) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self.http.get(url).query(params);
            let (message, retry_after) = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .await
                            .map_err(|e| MefError::Http(format!("Body read failed: {}", e)));
                    }
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    if status.as_u16() == 429 || status.is_server_error() {
                        (format!("HTTP {} from {}", status, url), retry_after)
                    } else {
                        return Err(MefError::Http(format!("HTTP {} from {}", status, url)));
                    }
                }
                Err(e) => (format!("Request to {} failed: {}", url, e), None),
            };

            if attempt >= MAX_HTTP_RETRIES {
                return Err(MefError::Transient(message));
            }

            let backoff = match retry_after {
                Some(secs) => Duration::from_secs(secs),
                None => {
                    let jitter: u64 = rand::thread_rng().gen_range(0..250);
                    Duration::from_millis(BASE_BACKOFF_MS * (1u64 << (attempt - 1)) + jitter)
                }
            };
            warn!(url = %url, attempt, backoff_ms = backoff.as_millis() as u64, "{}", message);
            tokio::time::sleep(backoff).await;
        }
    }
}

impl Default for OaiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an OAI-PMH response carrying MARCXML records.
///
/// `noRecordsMatch` yields an empty page; any other OAI error propagates.
pub fn parse_oai_response(xml: &str) -> Result<OaiPage> {
    let mut reader = Reader::from_str(xml);
    let mut page = OaiPage::default();

    let mut current_text = String::new();
    let mut in_header = false;
    let mut header_deleted = false;
    let mut identifier = String::new();
    let mut datestamp = String::new();
    let mut in_metadata = false;
    let mut marc = MarcRecord::default();
    let mut current_control: Option<String> = None;
    let mut current_data: Option<DataField> = None;
    let mut current_subfield: Option<String> = None;
    let mut error_code: Option<String> = None;

    fn attr(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
        e.attributes()
            .filter_map(|a| a.ok())
            .find(|a| a.key.local_name().as_ref() == name)
            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current_text.clear();
                match e.local_name().as_ref() {
                    b"error" => {
                        error_code = attr(&e, b"code");
                    }
                    b"header" => {
                        in_header = true;
                        header_deleted =
                            attr(&e, b"status").as_deref() == Some("deleted");
                        identifier.clear();
                        datestamp.clear();
                    }
                    b"metadata" => {
                        in_metadata = true;
                        marc = MarcRecord::default();
                    }
                    b"controlfield" if in_metadata => {
                        current_control = attr(&e, b"tag");
                    }
                    b"datafield" if in_metadata => {
                        current_data = Some(DataField {
                            tag: attr(&e, b"tag").unwrap_or_default(),
                            ind1: attr(&e, b"ind1").unwrap_or_default(),
                            ind2: attr(&e, b"ind2").unwrap_or_default(),
                            subfields: Vec::new(),
                        });
                    }
                    b"subfield" if in_metadata => {
                        current_subfield = attr(&e, b"code");
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| MefError::Http(format!("Bad OAI text content: {}", e)))?;
                current_text.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"error" => {
                    let code = error_code.take().unwrap_or_default();
                    if code == "noRecordsMatch" {
                        debug!("OAI window returned no records");
                        return Ok(OaiPage::default());
                    }
                    return Err(MefError::Http(format!(
                        "OAI error {}: {}",
                        code,
                        current_text.trim()
                    )));
                }
                b"identifier" if in_header => identifier = current_text.trim().to_string(),
                b"datestamp" if in_header => datestamp = current_text.trim().to_string(),
                b"header" => in_header = false,
                b"leader" if in_metadata => marc.leader = current_text.trim().to_string(),
                b"controlfield" if in_metadata => {
                    if let Some(tag) = current_control.take() {
                        marc.controlfields.push(ControlField {
                            tag,
                            value: current_text.trim().to_string(),
                        });
                    }
                }
                b"subfield" if in_metadata => {
                    if let (Some(code), Some(data)) =
                        (current_subfield.take(), current_data.as_mut())
                    {
                        data.subfields.push(Subfield {
                            code,
                            value: current_text.trim().to_string(),
                        });
                    }
                }
                b"datafield" if in_metadata => {
                    if let Some(data) = current_data.take() {
                        marc.datafields.push(data);
                    }
                }
                b"metadata" => in_metadata = false,
                b"record" if !in_metadata && !identifier.is_empty() => {
                    page.records.push(OaiRecord {
                        identifier: std::mem::take(&mut identifier),
                        datestamp: std::mem::take(&mut datestamp),
                        deleted: header_deleted,
                        marc: if marc.is_empty() {
                            None
                        } else {
                            Some(std::mem::take(&mut marc))
                        },
                    });
                    header_deleted = false;
                }
                b"resumptionToken" => {
                    let token = current_text.trim();
                    if !token.is_empty() {
                        page.resumption_token = Some(token.to_string());
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(MefError::Http(format!("OAI parse error: {}", e))),
        }
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_RECORDS: &str = r#"<?xml version="1.0"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-05-01T00:00:00Z</responseDate>
  <ListRecords>
    <record>
      <header>
        <identifier>oai:d-nb.info/gnd/12391664X</identifier>
        <datestamp>2024-04-20</datestamp>
      </header>
      <metadata>
        <record xmlns="http://www.loc.gov/MARC21/slim">
          <leader>00000nz  a2200000oc 4500</leader>
          <controlfield tag="001">12391664X</controlfield>
          <datafield tag="100" ind1="1" ind2=" ">
            <subfield code="a">Mustermann, Max</subfield>
          </datafield>
        </record>
      </metadata>
    </record>
    <record>
      <header status="deleted">
        <identifier>oai:d-nb.info/gnd/999</identifier>
        <datestamp>2024-04-21</datestamp>
      </header>
    </record>
    <resumptionToken>page-2</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    #[test]
    fn test_parse_list_records() {
        let page = parse_oai_response(LIST_RECORDS).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.resumption_token.as_deref(), Some("page-2"));

        let first = &page.records[0];
        assert!(!first.deleted);
        assert_eq!(first.source_pid().as_deref(), Some("12391664X"));
        assert_eq!(
            first.marc.as_ref().unwrap().subfield("100", "a"),
            Some("Mustermann, Max")
        );

        let second = &page.records[1];
        assert!(second.deleted);
        assert!(second.marc.is_none());
        assert_eq!(second.source_pid().as_deref(), Some("999"));
    }

    #[test]
    fn test_no_records_match_is_empty_page() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nothing</error></OAI-PMH>"#;
        let page = parse_oai_response(xml).unwrap();
        assert!(page.records.is_empty());
    }

    #[test]
    fn test_other_oai_error_propagates() {
        let xml = r#"<OAI-PMH><error code="badArgument">oops</error></OAI-PMH>"#;
        let err = parse_oai_response(xml).unwrap_err();
        assert!(matches!(err, MefError::Http(_)));
    }
}
