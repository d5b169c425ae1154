use std::collections::{HashMap, HashSet};
use std::thread;

use crate::audit::{self, AuditEvent};
use crate::error::PmError;
use crate::eutils::{BATCH_SIZE, FetchClient, RATE_LIMIT_DELAY, merge_fragments};
use crate::store::{Category, Store};

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// `(pmid, fragment)` pairs in requested order after dedup. PMIDs the
    /// collaborator could not resolve are omitted, not cached, and will be
    /// retried by a later call.
    pub fragments: Vec<(String, String)>,
    pub requested: usize,
    pub cached: usize,
    pub fetched: usize,
}

/// Collapse duplicates, preserving first-occurrence order. Empty and
/// whitespace-only entries are dropped.
pub fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for id in ids {
        let id = id.trim();
        if id.is_empty() || !seen.insert(id.to_string()) {
            continue;
        }
        unique.push(id.to_string());
    }
    unique
}

/// Fetch PubMed XML fragments for `pmids`, read-through against the
/// `fetch` cache category (one fragment file per PMID).
///
/// The audit event is written before any cache write, matching the
/// crate-wide audit-before-cache ordering.
pub fn fetch(
    client: &dyn FetchClient,
    pmids: &[String],
    store: &Store,
    refresh: bool,
) -> Result<FetchOutcome, PmError> {
    let unique = dedup(pmids);
    if unique.is_empty() {
        return Ok(FetchOutcome {
            fragments: Vec::new(),
            requested: 0,
            cached: 0,
            fetched: 0,
        });
    }

    let mut cached: HashMap<String, String> = HashMap::new();
    let mut uncached: Vec<String> = Vec::new();
    if refresh {
        uncached = unique.clone();
    } else {
        for pmid in &unique {
            match store.read(Category::Fetch, &format!("{pmid}.xml")) {
                Some(fragment) => {
                    cached.insert(pmid.clone(), fragment);
                }
                None => uncached.push(pmid.clone()),
            }
        }
    }

    let mut fetched: HashMap<String, String> = HashMap::new();
    for (batch_num, batch) in uncached.chunks(BATCH_SIZE).enumerate() {
        if batch_num > 0 {
            thread::sleep(RATE_LIMIT_DELAY);
        }
        tracing::info!(batch = batch_num + 1, pmids = batch.len(), "fetching batch");
        fetched.extend(client.efetch(batch)?);
    }

    audit::append(
        store.root(),
        AuditEvent::new("fetch")
            .field("requested", unique.len() as u64)
            .field("cached", cached.len() as u64)
            .field("fetched", fetched.len() as u64)
            .field("refreshed", refresh),
    )?;

    // caching is best-effort: a failed write never discards fetched data
    for (pmid, fragment) in &fetched {
        if let Err(err) = store.write(Category::Fetch, &format!("{pmid}.xml"), fragment) {
            tracing::warn!(%pmid, error = %err, "cache write failed");
        }
    }

    let requested = unique.len();
    let cached_count = cached.len();
    let fetched_count = fetched.len();
    let mut fragments = Vec::new();
    for pmid in unique {
        if let Some(fragment) = cached.remove(&pmid).or_else(|| fetched.remove(&pmid)) {
            fragments.push((pmid, fragment));
        }
    }

    Ok(FetchOutcome {
        fragments,
        requested,
        cached: cached_count,
        fetched: fetched_count,
    })
}

/// Fetch and reassemble into one `PubmedArticleSet` document, the shape
/// the CLI prints. Empty when nothing resolved.
pub fn fetch_document(
    client: &dyn FetchClient,
    pmids: &[String],
    store: &Store,
    refresh: bool,
) -> Result<String, PmError> {
    let outcome = fetch(client, pmids, store, refresh)?;
    let fragments: Vec<&str> = outcome
        .fragments
        .iter()
        .map(|(_, fragment)| fragment.as_str())
        .collect();
    Ok(merge_fragments(&fragments))
}
