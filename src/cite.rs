use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::audit::{self, AuditEvent};
use crate::error::PmError;
use crate::eutils::{BATCH_SIZE, RATE_LIMIT_DELAY};
use crate::fetch::dedup;
use crate::store::{Category, Store};

const API_URL: &str = "https://pmc.ncbi.nlm.nih.gov/api/ctxp/v1/pubmed/";

/// One Citation Exporter batch: CSL-JSON items for the requested PMIDs.
pub trait CiteClient {
    fn fetch_batch(&self, pmids: &[String]) -> Result<Vec<Value>, PmError>;
}

#[derive(Clone)]
pub struct CiteHttpClient {
    client: Client,
}

impl CiteHttpClient {
    pub fn new() -> Result<Self, PmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pm-tools/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PmError::CiteHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PmError::CiteHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl CiteClient for CiteHttpClient {
    fn fetch_batch(&self, pmids: &[String]) -> Result<Vec<Value>, PmError> {
        let ids_param = pmids.join(",");
        let response = self
            .client
            .get(API_URL)
            .query(&[("format", "csl"), ("id", ids_param.as_str())])
            .send()
            .map_err(|err| PmError::CiteHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "Citation Exporter request failed".to_string());
            return Err(PmError::CiteStatus {
                status: status.as_u16(),
                message,
            });
        }
        let data: Value = response
            .json()
            .map_err(|err| PmError::CiteHttp(err.to_string()))?;
        Ok(match data {
            Value::Array(items) => items,
            single => vec![single],
        })
    }
}

#[derive(Debug, Clone)]
pub struct CiteOutcome {
    /// CSL-JSON citations in requested order after dedup. PMIDs the
    /// exporter did not resolve are omitted.
    pub citations: Vec<Value>,
    pub requested: usize,
    pub cached: usize,
    pub fetched: usize,
}

/// Fetch CSL-JSON citations, read-through against the `cite` cache
/// category (one JSON file per PMID).
///
/// A failed batch is skipped and later batches still run; items without a
/// `PMID` field cannot be keyed and are dropped.
pub fn cite(
    client: &dyn CiteClient,
    pmids: &[String],
    store: &Store,
    refresh: bool,
) -> Result<CiteOutcome, PmError> {
    cite_with(client, pmids, store, refresh, BATCH_SIZE)
}

pub fn cite_with(
    client: &dyn CiteClient,
    pmids: &[String],
    store: &Store,
    refresh: bool,
    batch_size: usize,
) -> Result<CiteOutcome, PmError> {
    let unique = dedup(pmids);
    if unique.is_empty() {
        return Ok(CiteOutcome {
            citations: Vec::new(),
            requested: 0,
            cached: 0,
            fetched: 0,
        });
    }

    let mut cached: HashMap<String, Value> = HashMap::new();
    let mut uncached: Vec<String> = Vec::new();
    if refresh {
        uncached = unique.clone();
    } else {
        for pmid in &unique {
            let parsed = store
                .read(Category::Cite, &format!("{pmid}.json"))
                .and_then(|payload| serde_json::from_str::<Value>(&payload).ok());
            match parsed {
                Some(item) => {
                    cached.insert(pmid.clone(), item);
                }
                None => uncached.push(pmid.clone()),
            }
        }
    }

    let mut fetched: HashMap<String, Value> = HashMap::new();
    for (batch_num, batch) in uncached.chunks(batch_size).enumerate() {
        if batch_num > 0 {
            thread::sleep(RATE_LIMIT_DELAY);
        }
        tracing::info!(batch = batch_num + 1, pmids = batch.len(), "fetching citations");
        let items = match client.fetch_batch(batch) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(batch = batch_num + 1, error = %err, "citation batch failed, skipping");
                continue;
            }
        };
        for item in items {
            let Some(pmid) = item.get("PMID").and_then(Value::as_str) else {
                continue;
            };
            fetched.insert(pmid.to_string(), item);
        }
    }

    audit::append(
        store.root(),
        AuditEvent::new("cite")
            .field("requested", unique.len() as u64)
            .field("cached", cached.len() as u64)
            .field("fetched", fetched.len() as u64)
            .field("refreshed", refresh),
    )?;

    // caching is best-effort: a failed write never discards fetched data
    for (pmid, item) in &fetched {
        let written = serde_json::to_string(item)
            .map_err(|err| PmError::Filesystem(err.to_string()))
            .and_then(|payload| store.write(Category::Cite, &format!("{pmid}.json"), &payload));
        if let Err(err) = written {
            tracing::warn!(%pmid, error = %err, "cache write failed");
        }
    }

    let requested = unique.len();
    let cached_count = cached.len();
    let fetched_count = fetched.len();
    let mut citations = Vec::new();
    for pmid in unique {
        if let Some(item) = cached.remove(&pmid).or_else(|| fetched.remove(&pmid)) {
            citations.push(item);
        }
    }

    Ok(CiteOutcome {
        citations,
        requested,
        cached: cached_count,
        fetched: fetched_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::cell::RefCell;

    struct StubCite {
        available: Vec<String>,
        fail_batches: Vec<usize>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl StubCite {
        fn with(pmids: &[&str]) -> Self {
            Self {
                available: pmids.iter().map(|s| s.to_string()).collect(),
                fail_batches: Vec::new(),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn failing_on(mut self, batch: usize) -> Self {
            self.fail_batches.push(batch);
            self
        }
    }

    impl CiteClient for StubCite {
        fn fetch_batch(&self, pmids: &[String]) -> Result<Vec<Value>, PmError> {
            self.calls.borrow_mut().push(pmids.to_vec());
            let batch_index = self.calls.borrow().len();
            if self.fail_batches.contains(&batch_index) {
                return Err(PmError::CiteStatus {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(pmids
                .iter()
                .filter(|p| self.available.contains(p))
                .map(|p| citation(p))
                .collect())
        }
    }

    fn citation(pmid: &str) -> Value {
        serde_json::json!({ "PMID": pmid, "title": format!("Title {pmid}") })
    }

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let root = crate::store::init(&dir).unwrap();
        (temp, Store::from_root(root))
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn citations_come_back_in_input_order() {
        let (_temp, store) = temp_store();
        store
            .write(Category::Cite, "2.json", &citation("2").to_string())
            .unwrap();
        let client = StubCite::with(&["1", "3"]);

        let outcome = cite(&client, &ids(&["1", "2", "3"]), &store, false).unwrap();
        let order: Vec<&str> = outcome
            .citations
            .iter()
            .map(|c| c["PMID"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["1", "2", "3"]);
        assert_eq!(outcome.cached, 1);
        assert_eq!(outcome.fetched, 2);
    }

    #[test]
    fn duplicates_are_requested_once() {
        let (_temp, store) = temp_store();
        let client = StubCite::with(&["1"]);
        let outcome = cite(&client, &ids(&["1", "1", "1"]), &store, false).unwrap();
        assert_eq!(outcome.requested, 1);
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(client.calls.borrow().len(), 1);
        assert_eq!(client.calls.borrow()[0], vec!["1"]);
    }

    #[test]
    fn failed_batch_does_not_abort_later_batches() {
        let (_temp, store) = temp_store();
        let client = StubCite::with(&["1", "2", "3", "4"]).failing_on(1);

        // batch size 2: first batch fails, second succeeds
        let outcome = cite_with(&client, &ids(&["1", "2", "3", "4"]), &store, false, 2).unwrap();
        assert_eq!(client.calls.borrow().len(), 2);
        assert_eq!(outcome.fetched, 2);
        let order: Vec<&str> = outcome
            .citations
            .iter()
            .map(|c| c["PMID"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["3", "4"]);
    }

    #[test]
    fn fetched_items_land_in_cache() {
        let (_temp, store) = temp_store();
        let client = StubCite::with(&["7"]);
        cite(&client, &ids(&["7"]), &store, false).unwrap();

        let payload = store.read(Category::Cite, "7.json").unwrap();
        let item: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(item["PMID"], "7");

        // second call is fully served from cache
        let outcome = cite(&client, &ids(&["7"]), &store, false).unwrap();
        assert_eq!(outcome.cached, 1);
        assert_eq!(client.calls.borrow().len(), 1);
    }

    #[test]
    fn cache_write_failure_still_returns_citations() {
        let (_temp, store) = temp_store();
        // a directory squatting on the entry path makes the write fail
        let squat = store
            .root()
            .unwrap()
            .join("cache")
            .join("cite")
            .join("7.json");
        std::fs::create_dir_all(squat.as_std_path()).unwrap();
        let client = StubCite::with(&["7"]);

        let outcome = cite(&client, &ids(&["7"]), &store, false).unwrap();
        assert_eq!(outcome.fetched, 1);
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.citations[0]["PMID"], "7");
    }

    #[test]
    fn item_without_pmid_is_dropped() {
        struct NoPmid;
        impl CiteClient for NoPmid {
            fn fetch_batch(&self, _pmids: &[String]) -> Result<Vec<Value>, PmError> {
                Ok(vec![serde_json::json!({ "title": "anonymous" })])
            }
        }
        let (_temp, store) = temp_store();
        let outcome = cite(&NoPmid, &ids(&["1"]), &store, false).unwrap();
        assert!(outcome.citations.is_empty());
        assert_eq!(outcome.fetched, 0);
    }

    #[test]
    fn audit_event_summarizes_the_call() {
        let (_temp, store) = temp_store();
        store
            .write(Category::Cite, "1.json", &citation("1").to_string())
            .unwrap();
        let client = StubCite::with(&["2"]);
        cite(&client, &ids(&["1", "2"]), &store, false).unwrap();

        let events = crate::audit::read_events(store.root().unwrap());
        let event = events.last().unwrap();
        assert_eq!(event["op"], "cite");
        assert_eq!(event["requested"], 2);
        assert_eq!(event["cached"], 1);
        assert_eq!(event["fetched"], 1);
        assert_eq!(event["refreshed"], false);
    }
}
