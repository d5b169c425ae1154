use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::{self, AuditEvent, utc_timestamp};
use crate::error::PmError;
use crate::eutils::SearchClient;
use crate::store::{Category, Store};

pub const DEFAULT_MAX: usize = 10_000;

/// Envelope stored alongside the PMID list so a later cache hit can report
/// how stale the answer is without re-deriving anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEnvelope {
    pub query: String,
    pub max_results: usize,
    pub pmids: Vec<String>,
    pub count: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub pmids: Vec<String>,
    pub cached: bool,
    /// Timestamp of the original fetch, present only on a cache hit.
    pub original_ts: Option<String>,
}

/// Whole-request cache key: whitespace-collapsed query plus result limit,
/// canonicalized as sorted-key JSON and hashed to a filename-safe digest.
/// Case and punctuation are deliberately NOT folded; queries differing
/// only by trailing punctuation are distinct entries.
pub fn cache_key(query: &str, max_results: usize) -> String {
    let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let canonical =
        serde_json::json!({ "max": max_results, "query": normalized }).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}.json")
}

/// Search PubMed, read-through against the `search` cache category.
///
/// On a fresh fetch the audit event is written before the cache entry:
/// a crash between the two leaves the audit trail complete and only costs
/// a re-fetch.
pub fn search(
    client: &dyn SearchClient,
    query: &str,
    max_results: usize,
    store: &Store,
    refresh: bool,
) -> Result<SearchOutcome, PmError> {
    if query.trim().is_empty() {
        return Err(PmError::EmptyQuery);
    }

    let key = cache_key(query, max_results);

    if !refresh
        && let Some(cached) = store.read(Category::Search, &key)
        && let Ok(envelope) = serde_json::from_str::<SearchEnvelope>(&cached)
    {
        audit::append(
            store.root(),
            AuditEvent::new("search")
                .field("db", "pubmed")
                .field("query", query)
                .field("max", max_results as u64)
                .field("count", envelope.pmids.len() as u64)
                .field("cached", true)
                .field("original_ts", envelope.timestamp.clone()),
        )?;
        return Ok(SearchOutcome {
            pmids: envelope.pmids,
            cached: true,
            original_ts: Some(envelope.timestamp),
        });
    }

    let pmids = client.esearch(query, max_results)?;

    audit::append(
        store.root(),
        AuditEvent::new("search")
            .field("db", "pubmed")
            .field("query", query)
            .field("max", max_results as u64)
            .field("count", pmids.len() as u64)
            .field("cached", false)
            .field("refreshed", refresh),
    )?;

    let envelope = SearchEnvelope {
        query: query.to_string(),
        max_results,
        count: pmids.len(),
        pmids: pmids.clone(),
        timestamp: utc_timestamp(),
    };
    // caching is best-effort: a failed write never discards the result
    let written = serde_json::to_string(&envelope)
        .map_err(|err| PmError::Filesystem(err.to_string()))
        .and_then(|payload| store.write(Category::Search, &key, &payload));
    if let Err(err) = written {
        tracing::warn!(error = %err, "cache write failed");
    }

    Ok(SearchOutcome {
        pmids,
        cached: false,
        original_ts: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use std::cell::Cell;

    struct StubSearch {
        pmids: Vec<String>,
        calls: Cell<usize>,
    }

    impl StubSearch {
        fn returning(pmids: &[&str]) -> Self {
            Self {
                pmids: pmids.iter().map(|s| s.to_string()).collect(),
                calls: Cell::new(0),
            }
        }
    }

    impl SearchClient for StubSearch {
        fn esearch(&self, _query: &str, _max: usize) -> Result<Vec<String>, PmError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.pmids.clone())
        }
    }

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let root = crate::store::init(&dir).unwrap();
        (temp, Store::from_root(root))
    }

    #[test]
    fn key_collapses_internal_whitespace() {
        assert_eq!(cache_key("crispr  cancer", 100), cache_key("crispr cancer", 100));
        assert_eq!(cache_key("  crispr cancer  ", 100), cache_key("crispr cancer", 100));
    }

    #[test]
    fn key_keeps_case_and_punctuation_distinct() {
        assert_ne!(cache_key("crispr", 100), cache_key("crispr.", 100));
        assert_ne!(cache_key("crispr", 100), cache_key("CRISPR", 100));
        assert_ne!(cache_key("crispr", 100), cache_key("crispr", 200));
    }

    #[test]
    fn key_is_hex_digest_with_json_suffix() {
        let key = cache_key("anything", 10);
        assert_eq!(key.len(), 64 + ".json".len());
        assert!(key.ends_with(".json"));
        assert!(key[..64].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_query_is_an_error() {
        let (_temp, store) = temp_store();
        let client = StubSearch::returning(&[]);
        assert_matches!(
            search(&client, "   ", 10, &store, false),
            Err(PmError::EmptyQuery)
        );
        assert_eq!(client.calls.get(), 0);
    }

    #[test]
    fn second_call_is_served_from_cache() {
        let (_temp, store) = temp_store();
        let client = StubSearch::returning(&["1", "2", "3"]);

        let first = search(&client, "crispr cancer", 100, &store, false).unwrap();
        assert!(!first.cached);
        assert_eq!(first.pmids, vec!["1", "2", "3"]);
        assert_eq!(client.calls.get(), 1);

        let second = search(&client, "crispr cancer", 100, &store, false).unwrap();
        assert!(second.cached);
        assert_eq!(second.pmids, vec!["1", "2", "3"]);
        assert!(second.original_ts.is_some());
        assert_eq!(client.calls.get(), 1);
    }

    #[test]
    fn refresh_bypasses_cache() {
        let (_temp, store) = temp_store();
        let client = StubSearch::returning(&["1"]);
        search(&client, "q", 10, &store, false).unwrap();
        let outcome = search(&client, "q", 10, &store, true).unwrap();
        assert!(!outcome.cached);
        assert_eq!(client.calls.get(), 2);
    }

    #[test]
    fn audit_records_cached_and_fresh_calls() {
        let (_temp, store) = temp_store();
        let client = StubSearch::returning(&["1", "2"]);
        search(&client, "q", 10, &store, false).unwrap();
        search(&client, "q", 10, &store, false).unwrap();

        let events = crate::audit::read_events(store.root().unwrap());
        // init + two searches
        assert_eq!(events.len(), 3);
        assert_eq!(events[1]["op"], "search");
        assert_eq!(events[1]["cached"], false);
        assert_eq!(events[2]["cached"], true);
        assert_eq!(events[2]["count"], 2);
        assert!(events[2]["original_ts"].is_string());
    }

    #[test]
    fn cache_write_failure_still_returns_pmids() {
        let (_temp, store) = temp_store();
        // a directory squatting on the entry path makes the write fail
        let squat = store
            .root()
            .unwrap()
            .join("cache")
            .join("search")
            .join(cache_key("q", 10));
        std::fs::create_dir_all(squat.as_std_path()).unwrap();
        let client = StubSearch::returning(&["1", "2"]);

        let outcome = search(&client, "q", 10, &store, false).unwrap();
        assert!(!outcome.cached);
        assert_eq!(outcome.pmids, vec!["1", "2"]);
    }

    #[test]
    fn no_root_still_searches() {
        let store = Store::disabled();
        let client = StubSearch::returning(&["9"]);
        let outcome = search(&client, "q", 10, &store, false).unwrap();
        assert_eq!(outcome.pmids, vec!["9"]);
        // a second call hits the network again, nothing was cached
        search(&client, "q", 10, &store, false).unwrap();
        assert_eq!(client.calls.get(), 2);
    }
}
