use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::PmError;

const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// PMIDs per efetch request.
pub const BATCH_SIZE: usize = 200;
/// Inter-batch delay, ~3 requests per second.
pub const RATE_LIMIT_DELAY: Duration = Duration::from_millis(340);

const XML_HEADER: &str = "<?xml version=\"1.0\" ?>\n";
const XML_DOCTYPE: &str = "<!DOCTYPE PubmedArticleSet PUBLIC \"-//NLM//DTD PubMedArticle, 1st January 2024//EN\"\n \"https://dtd.nlm.nih.gov/ncbi/pubmed/out/pubmed_240101.dtd\">\n";

pub trait SearchClient {
    fn esearch(&self, query: &str, max_results: usize) -> Result<Vec<String>, PmError>;
}

/// One efetch batch: requested PMIDs in, a map of PMID to standalone XML
/// fragment out. PMIDs the API does not resolve are absent from the map.
pub trait FetchClient {
    fn efetch(&self, pmids: &[String]) -> Result<HashMap<String, String>, PmError>;
}

#[derive(Clone)]
pub struct EutilsHttpClient {
    client: Client,
    api_key: Option<String>,
}

impl EutilsHttpClient {
    pub fn new() -> Result<Self, PmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pm-tools/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PmError::EutilsHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PmError::EutilsHttp(err.to_string()))?;

        let api_key = std::env::var("NCBI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Ok(Self { client, api_key })
    }

    fn get_text(&self, url: &str, params: &[(&str, &str)]) -> Result<String, PmError> {
        let mut request = self.client.get(url).query(params);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }
        let response = request
            .send()
            .map_err(|err| PmError::EutilsHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "E-utilities request failed".to_string());
            return Err(PmError::EutilsStatus {
                status: status.as_u16(),
                message,
            });
        }
        response
            .text()
            .map_err(|err| PmError::EutilsHttp(err.to_string()))
    }
}

impl SearchClient for EutilsHttpClient {
    fn esearch(&self, query: &str, max_results: usize) -> Result<Vec<String>, PmError> {
        let retmax = max_results.to_string();
        let xml = self.get_text(
            ESEARCH_URL,
            &[
                ("db", "pubmed"),
                ("term", query),
                ("retmax", retmax.as_str()),
                ("retmode", "xml"),
            ],
        )?;
        extract_esearch_ids(&xml)
    }
}

impl FetchClient for EutilsHttpClient {
    fn efetch(&self, pmids: &[String]) -> Result<HashMap<String, String>, PmError> {
        if pmids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids_param = pmids.join(",");
        let xml = self.get_text(
            EFETCH_URL,
            &[
                ("db", "pubmed"),
                ("id", ids_param.as_str()),
                ("rettype", "abstract"),
                ("retmode", "xml"),
            ],
        )?;
        Ok(split_article_set(&xml)?.into_iter().collect())
    }
}

/// Extract the `<Id>` texts from an esearch response.
pub fn extract_esearch_ids(xml: &str) -> Result<Vec<String>, PmError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut ids = Vec::new();
    let mut in_id = false;
    loop {
        match reader
            .read_event()
            .map_err(|err| PmError::EutilsDecode(err.to_string()))?
        {
            Event::Start(e) if e.name().as_ref() == b"Id" => in_id = true,
            Event::End(e) if e.name().as_ref() == b"Id" => in_id = false,
            Event::Text(text) if in_id => {
                let id = text
                    .unescape()
                    .map_err(|err| PmError::EutilsDecode(err.to_string()))?
                    .trim()
                    .to_string();
                if !id.is_empty() {
                    ids.push(id);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(ids)
}

/// Split an efetch `PubmedArticleSet` document into standalone per-article
/// fragments keyed by PMID. Articles without a PMID are dropped; they
/// cannot be cached or reassembled.
pub fn split_article_set(xml: &str) -> Result<Vec<(String, String)>, PmError> {
    let mut reader = Reader::from_str(xml);
    let mut fragments = Vec::new();
    let mut writer: Option<Writer<Cursor<Vec<u8>>>> = None;
    let mut depth = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
        match event {
            Event::Start(_) => {
                depth += 1;
                if depth == 2 && writer.is_none() {
                    writer = Some(Writer::new(Cursor::new(Vec::new())));
                }
                if let Some(w) = writer.as_mut() {
                    w.write_event(event)
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                }
            }
            Event::End(_) => {
                if let Some(w) = writer.as_mut() {
                    w.write_event(event)
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                }
                if depth == 2
                    && let Some(captured) = writer.take()
                {
                    let bytes = captured.into_inner().into_inner();
                    let fragment = String::from_utf8(bytes)
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                    if let Some(pmid) = first_element_text(&fragment, "PMID")? {
                        fragments.push((pmid, fragment));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Empty(_) => {
                if depth == 1 {
                    // self-closing top-level child, a fragment of its own
                    let mut w = Writer::new(Cursor::new(Vec::new()));
                    w.write_event(event)
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                    let fragment = String::from_utf8(w.into_inner().into_inner())
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                    if let Some(pmid) = first_element_text(&fragment, "PMID")? {
                        fragments.push((pmid, fragment));
                    }
                } else if let Some(w) = writer.as_mut() {
                    w.write_event(event)
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                }
            }
            Event::Text(_) | Event::CData(_) => {
                if let Some(w) = writer.as_mut() {
                    w.write_event(event)
                        .map_err(|err| PmError::EutilsDecode(err.to_string()))?;
                }
            }
            Event::Eof => break,
            // declaration, doctype, comments, PIs outside the capture
            _ => {}
        }
    }
    Ok(fragments)
}

/// Text of the first element named `name`, in document order.
pub fn first_element_text(xml: &str, name: &str) -> Result<Option<String>, PmError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_target = false;
    loop {
        match reader
            .read_event()
            .map_err(|err| PmError::EutilsDecode(err.to_string()))?
        {
            Event::Start(e) if e.name().as_ref() == name.as_bytes() => in_target = true,
            Event::Text(text) if in_target => {
                let value = text
                    .unescape()
                    .map_err(|err| PmError::EutilsDecode(err.to_string()))?
                    .trim()
                    .to_string();
                return Ok(Some(value));
            }
            Event::End(e) if e.name().as_ref() == name.as_bytes() => in_target = false,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Rebuild a single `PubmedArticleSet` document from per-article fragments.
pub fn merge_fragments<S: AsRef<str>>(fragments: &[S]) -> String {
    if fragments.is_empty() {
        return String::new();
    }
    let articles = fragments
        .iter()
        .map(|f| f.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    format!("{XML_HEADER}{XML_DOCTYPE}<PubmedArticleSet>\n{articles}\n</PubmedArticleSet>")
}
