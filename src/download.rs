use std::fs;
use std::io::Read;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tar::Archive;

use crate::audit::{self, AuditEvent};
use crate::error::PmError;
use crate::eutils::{BATCH_SIZE, RATE_LIMIT_DELAY};

const IDCONV_URL: &str = "https://pmc.ncbi.nlm.nih.gov/tools/idconv/api/v1/articles/";
const OA_URL: &str = "https://www.ncbi.nlm.nih.gov/pmc/utils/oa/oa.fcgi";
const UNPAYWALL_URL: &str = "https://api.unpaywall.org/v2";

pub const MAX_ATTEMPTS: usize = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Guard against decompression bombs inside PMC archives.
pub const MAX_PDF_MEMBER_SIZE: u64 = 200 * 1024 * 1024;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 503)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmcFormat {
    Pdf,
    Tgz,
}

#[derive(Debug, Clone)]
pub struct PmcLink {
    pub url: String,
    pub format: PmcFormat,
}

/// PMID with whatever alternate identifiers are known for it.
#[derive(Debug, Clone, Default)]
pub struct ArticleIds {
    pub pmid: String,
    pub pmcid: String,
    pub doi: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pmc,
    Unpaywall,
}

/// Resolved download source for one article; `url` is `None` when no
/// open-access copy was found.
#[derive(Debug, Clone)]
pub struct PdfSource {
    pub pmid: String,
    pub kind: Option<SourceKind>,
    pub url: Option<String>,
    pub pmcid: Option<String>,
    pub pmc_format: Option<PmcFormat>,
}

pub trait SourceClient {
    fn convert_pmids(&self, pmids: &[String], email: &str) -> Result<Vec<ArticleIds>, PmError>;
    fn pmc_lookup(&self, pmcid: &str) -> Result<Option<PmcLink>, PmError>;
    fn unpaywall_lookup(&self, doi: &str, email: &str) -> Result<Option<String>, PmError>;
}

#[derive(Debug, Clone)]
pub struct HttpBody {
    pub status: u16,
    pub bytes: Vec<u8>,
}

pub trait DownloadClient {
    fn get(&self, url: &str) -> Result<HttpBody, PmError>;
}

#[derive(Clone)]
pub struct PdfHttpClient {
    client: Client,
}

impl PdfHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, PmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pm-tools/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PmError::DownloadHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| PmError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn get_text(&self, url: &str) -> Result<(u16, String), reqwest::Error> {
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        let text = response.text()?;
        Ok((status, text))
    }
}

impl DownloadClient for PdfHttpClient {
    fn get(&self, url: &str) -> Result<HttpBody, PmError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| PmError::DownloadHttp(err.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .map_err(|err| PmError::DownloadHttp(err.to_string()))?
            .to_vec();
        Ok(HttpBody { status, bytes })
    }
}

impl SourceClient for PdfHttpClient {
    fn convert_pmids(&self, pmids: &[String], email: &str) -> Result<Vec<ArticleIds>, PmError> {
        let mut records = Vec::new();
        for (batch_num, batch) in pmids.chunks(BATCH_SIZE).enumerate() {
            if batch_num > 0 {
                thread::sleep(RATE_LIMIT_DELAY);
            }
            let url = format!(
                "{IDCONV_URL}?ids={}&format=json&tool=pm-download&email={email}",
                batch.join(",")
            );
            let (status, text) = self
                .get_text(&url)
                .map_err(|err| PmError::IdConvHttp(err.to_string()))?;
            if status != 200 {
                return Err(PmError::IdConvStatus {
                    status,
                    message: text,
                });
            }
            let data: Value = serde_json::from_str(&text)
                .map_err(|err| PmError::IdConvHttp(err.to_string()))?;
            if let Some(items) = data.get("records").and_then(Value::as_array) {
                for record in items {
                    records.push(ArticleIds {
                        pmid: string_field(record, "pmid"),
                        pmcid: string_field(record, "pmcid"),
                        doi: string_field(record, "doi"),
                    });
                }
            }
        }
        Ok(records)
    }

    fn pmc_lookup(&self, pmcid: &str) -> Result<Option<PmcLink>, PmError> {
        let url = format!("{OA_URL}?id={pmcid}");
        tracing::debug!(%url, "PMC lookup");
        let (status, text) = self
            .get_text(&url)
            .map_err(|err| PmError::PmcHttp(err.to_string()))?;
        if status != 200 {
            tracing::warn!(pmcid, status, "PMC lookup failed");
            return Ok(None);
        }
        if text.contains("<error") {
            tracing::warn!(pmcid, "PMC lookup returned API error");
            return Ok(None);
        }
        Ok(parse_oa_links(&text))
    }

    fn unpaywall_lookup(&self, doi: &str, email: &str) -> Result<Option<String>, PmError> {
        let encoded_doi = doi.replace('/', "%2F");
        let url = format!("{UNPAYWALL_URL}/{encoded_doi}?email={email}");
        tracing::debug!(%url, "Unpaywall lookup");
        let (status, text) = self
            .get_text(&url)
            .map_err(|err| PmError::UnpaywallHttp(err.to_string()))?;
        if status != 200 {
            tracing::warn!(doi, status, "Unpaywall lookup failed");
            return Ok(None);
        }
        let Ok(data) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!(doi, "Unpaywall response was not JSON");
            return Ok(None);
        };
        if !data.get("is_oa").and_then(Value::as_bool).unwrap_or(false) {
            tracing::debug!(doi, "not open access");
            return Ok(None);
        }
        Ok(data
            .get("best_oa_location")
            .and_then(|loc| loc.get("url_for_pdf"))
            .and_then(Value::as_str)
            .map(String::from))
    }
}

fn string_field(record: &Value, key: &str) -> String {
    record
        .get(key)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
        .unwrap_or_default()
}

/// Pick the PDF or tgz link out of a PMC OA response, preferring pdf.
/// ftp links are rewritten to https.
fn parse_oa_links(xml: &str) -> Option<PmcLink> {
    let mut reader = Reader::from_str(xml);
    let mut pdf_href: Option<String> = None;
    let mut tgz_href: Option<String> = None;
    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(_) => return None,
        };
        match event {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"link" => {
                let mut format = None;
                let mut href = None;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"format" => format = Some(value),
                        b"href" => href = Some(value),
                        _ => {}
                    }
                }
                let Some(mut href) = href else { continue };
                if let Some(rest) = href.strip_prefix("ftp://") {
                    href = format!("https://{rest}");
                }
                match format.as_deref() {
                    Some("pdf") => pdf_href = Some(href),
                    Some("tgz") => tgz_href = Some(href),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if let Some(url) = pdf_href {
        return Some(PmcLink {
            url,
            format: PmcFormat::Pdf,
        });
    }
    tgz_href.map(|url| PmcLink {
        url,
        format: PmcFormat::Tgz,
    })
}

/// Resolve a download source per article: PMC OA first, Unpaywall as
/// fallback. A lookup failure for one article never aborts the rest.
pub fn find_pdf_sources(
    client: &dyn SourceClient,
    articles: &[ArticleIds],
    email: Option<&str>,
    pmc_only: bool,
    unpaywall_only: bool,
) -> Vec<PdfSource> {
    let mut sources = Vec::new();
    for article in articles {
        let mut resolved = None;

        if !unpaywall_only && !article.pmcid.is_empty() {
            match client.pmc_lookup(&article.pmcid) {
                Ok(Some(link)) => {
                    resolved = Some(PdfSource {
                        pmid: article.pmid.clone(),
                        kind: Some(SourceKind::Pmc),
                        url: Some(link.url),
                        pmcid: Some(article.pmcid.clone()),
                        pmc_format: Some(link.format),
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(pmid = %article.pmid, error = %err, "PMC lookup error");
                }
            }
        }

        if resolved.is_none()
            && !pmc_only
            && !article.doi.is_empty()
            && let Some(email) = email
        {
            match client.unpaywall_lookup(&article.doi, email) {
                Ok(Some(url)) => {
                    resolved = Some(PdfSource {
                        pmid: article.pmid.clone(),
                        kind: Some(SourceKind::Unpaywall),
                        url: Some(url),
                        pmcid: None,
                        pmc_format: None,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(pmid = %article.pmid, error = %err, "Unpaywall lookup error");
                }
            }
        }

        sources.push(resolved.unwrap_or_else(|| {
            tracing::debug!(pmid = %article.pmid, "no PDF source found");
            PdfSource {
                pmid: article.pmid.clone(),
                kind: None,
                url: None,
                pmcid: None,
                pmc_format: None,
            }
        }));
    }
    sources
}

/// Why one item failed; retry exhaustion and archive problems are normal
/// per-item outcomes, not batch aborts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    NoUrl,
    HttpStatus(u16),
    EmptyBody,
    NoPdfInArchive,
    Network(String),
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Downloaded,
    Skipped,
    Failed(FailReason),
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub pmid: String,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ItemOutcome>,
}

/// GET with bounded retry: up to three attempts for 429/503, linearly
/// increasing delay between them. The final response is returned even if
/// still retryable; the caller maps non-success statuses to a failure.
pub fn get_with_retry(client: &dyn DownloadClient, url: &str) -> Result<HttpBody, PmError> {
    for attempt in 1..MAX_ATTEMPTS {
        let response = client.get(url)?;
        if !is_retryable_status(response.status) {
            return Ok(response);
        }
        thread::sleep(RETRY_BASE_DELAY * attempt as u32);
    }
    client.get(url)
}

/// Download PDFs for the resolved sources. Every per-item error degrades
/// to a recorded failure; the loop always runs to completion. One audit
/// event summarizes the whole call.
pub fn download_pdfs(
    client: &dyn DownloadClient,
    sources: &[PdfSource],
    output_dir: &Utf8Path,
    overwrite: bool,
    root: Option<&Utf8Path>,
) -> Result<DownloadReport, PmError> {
    fs::create_dir_all(output_dir.as_std_path())
        .map_err(|err| PmError::Filesystem(err.to_string()))?;

    let mut report = DownloadReport::default();
    for source in sources {
        let status = download_one(client, source, output_dir, overwrite);
        match &status {
            ItemStatus::Downloaded => report.downloaded += 1,
            ItemStatus::Skipped => report.skipped += 1,
            ItemStatus::Failed(reason) => {
                tracing::warn!(pmid = %source.pmid, ?reason, "download failed");
                report.failed += 1;
            }
        }
        report.items.push(ItemOutcome {
            pmid: source.pmid.clone(),
            status,
        });
    }

    audit::append(
        root,
        AuditEvent::new("download")
            .field("total", sources.len() as u64)
            .field("downloaded", report.downloaded as u64)
            .field("skipped", report.skipped as u64)
            .field("failed", report.failed as u64),
    )?;

    Ok(report)
}

fn download_one(
    client: &dyn DownloadClient,
    source: &PdfSource,
    output_dir: &Utf8Path,
    overwrite: bool,
) -> ItemStatus {
    let Some(url) = source.url.as_deref() else {
        return ItemStatus::Failed(FailReason::NoUrl);
    };

    let out_file = output_dir.join(format!("{}.pdf", source.pmid));
    if out_file.as_std_path().exists() && !overwrite {
        return ItemStatus::Skipped;
    }

    let response = match get_with_retry(client, url) {
        Ok(response) => response,
        Err(err) => return ItemStatus::Failed(FailReason::Network(err.to_string())),
    };
    if !matches!(response.status, 200 | 226) {
        return ItemStatus::Failed(FailReason::HttpStatus(response.status));
    }
    if response.bytes.is_empty() {
        return ItemStatus::Failed(FailReason::EmptyBody);
    }

    let content = if source.pmc_format == Some(PmcFormat::Tgz) {
        let pmcid = source.pmcid.as_deref().unwrap_or("");
        match extract_pdf_from_tgz(&response.bytes, pmcid) {
            Some(pdf) => pdf,
            None => return ItemStatus::Failed(FailReason::NoPdfInArchive),
        }
    } else {
        response.bytes
    };

    match fs::write(out_file.as_std_path(), &content) {
        Ok(()) => ItemStatus::Downloaded,
        Err(err) => ItemStatus::Failed(FailReason::Io(err.to_string())),
    }
}

/// Extract the article PDF from a PMC tar.gz archive, fully in memory
/// (archive paths never touch the filesystem). Members above the size
/// bound are rejected. Among candidates, a name containing the PMCID
/// wins; otherwise the largest member (main article over supplements).
pub fn extract_pdf_from_tgz(content: &[u8], pmcid: &str) -> Option<Vec<u8>> {
    let mut candidates: Vec<(usize, String, u64)> = Vec::new();
    let mut archive = Archive::new(GzDecoder::new(content));
    for (index, entry) in archive.entries().ok()?.enumerate() {
        let entry = entry.ok()?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().ok()?.to_string_lossy().to_lowercase();
        let size = entry.size();
        if name.ends_with(".pdf") && size > 0 && size <= MAX_PDF_MEMBER_SIZE {
            candidates.push((index, name, size));
        }
    }
    if candidates.is_empty() {
        return None;
    }

    let pmcid_lower = pmcid.to_lowercase();
    if !pmcid_lower.is_empty() {
        let matching: Vec<_> = candidates
            .iter()
            .filter(|(_, name, _)| name.contains(&pmcid_lower))
            .cloned()
            .collect();
        if !matching.is_empty() {
            candidates = matching;
        }
    }
    let best_index = candidates.iter().max_by_key(|(_, _, size)| *size)?.0;

    let mut archive = Archive::new(GzDecoder::new(content));
    for (index, entry) in archive.entries().ok()?.enumerate() {
        if index != best_index {
            continue;
        }
        let mut entry = entry.ok()?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data).ok()?;
        return if data.is_empty() { None } else { Some(data) };
    }
    None
}
