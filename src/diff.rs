use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;

use camino::Utf8Path;
use serde_json::{Map, Value, json};

use crate::error::PmError;
use crate::filter::read_jsonl;

/// One difference record: `added`, `removed`, or `changed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub pmid: String,
    pub entry: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub unchanged: usize,
}

/// Compare two article lists by PMID.
///
/// Output order is a contract: removed records first, then changed, then
/// added, each bucket in the order PMIDs first appear in its input list.
/// Duplicate PMIDs keep the last occurrence's value. Entries that are not
/// objects or lack a `pmid` are ignored.
pub fn diff_jsonl(
    old_articles: &[Value],
    new_articles: &[Value],
    ignore_fields: &[String],
) -> Vec<DiffRecord> {
    let ignore: HashSet<&str> = ignore_fields.iter().map(String::as_str).collect();
    let old = index_by_pmid(old_articles);
    let new = index_by_pmid(new_articles);

    let mut removed = Vec::new();
    let mut changed = Vec::new();
    for (pmid, old_article) in &old.entries {
        match new.get(pmid) {
            None => removed.push(DiffRecord {
                pmid: pmid.clone(),
                entry: json!({
                    "pmid": pmid,
                    "status": "removed",
                    "article": old_article,
                }),
            }),
            Some(new_article) => {
                let changed_fields = changed_fields(old_article, new_article, &ignore);
                if !changed_fields.is_empty() {
                    changed.push(DiffRecord {
                        pmid: pmid.clone(),
                        entry: json!({
                            "pmid": pmid,
                            "status": "changed",
                            "old": old_article,
                            "new": new_article,
                            "changed_fields": changed_fields,
                        }),
                    });
                }
            }
        }
    }

    let mut added = Vec::new();
    for (pmid, new_article) in &new.entries {
        if old.get(pmid).is_none() {
            added.push(DiffRecord {
                pmid: pmid.clone(),
                entry: json!({
                    "pmid": pmid,
                    "status": "added",
                    "article": new_article,
                }),
            });
        }
    }

    let mut records = removed;
    records.append(&mut changed);
    records.append(&mut added);
    records
}

pub fn diff_summary(
    old_articles: &[Value],
    new_articles: &[Value],
    ignore_fields: &[String],
) -> DiffSummary {
    let records = diff_jsonl(old_articles, new_articles, ignore_fields);
    let mut summary = DiffSummary::default();
    for record in &records {
        match record.entry.get("status").and_then(Value::as_str) {
            Some("added") => summary.added += 1,
            Some("removed") => summary.removed += 1,
            Some("changed") => summary.changed += 1,
            _ => {}
        }
    }

    let old_pmids: HashSet<&str> = pmid_set(old_articles);
    let new_pmids: HashSet<&str> = pmid_set(new_articles);
    summary.unchanged = old_pmids.intersection(&new_pmids).count() - summary.changed;
    summary
}

/// Load a JSONL file, keeping only object lines that carry a `pmid`.
/// Malformed lines are skipped.
pub fn load_jsonl(path: &Utf8Path) -> Result<Vec<Value>, PmError> {
    let file = File::open(path.as_std_path())
        .map_err(|_| PmError::InputNotFound(path.to_string()))?;
    let articles = read_jsonl(BufReader::new(file))?;
    Ok(articles
        .into_iter()
        .filter(|value| value.is_object() && value.get("pmid").is_some())
        .collect())
}

struct PmidIndex<'a> {
    /// first-occurrence order, last-occurrence value
    entries: Vec<(String, &'a Value)>,
}

impl<'a> PmidIndex<'a> {
    fn get(&self, pmid: &str) -> Option<&'a Value> {
        self.entries
            .iter()
            .find(|(p, _)| p == pmid)
            .map(|(_, article)| *article)
    }
}

fn index_by_pmid(articles: &[Value]) -> PmidIndex<'_> {
    let mut entries: Vec<(String, &Value)> = Vec::new();
    for article in articles {
        if !article.is_object() {
            continue;
        }
        let Some(pmid) = article.get("pmid").and_then(Value::as_str) else {
            continue;
        };
        if pmid.is_empty() {
            continue;
        }
        match entries.iter_mut().find(|(p, _)| p == pmid) {
            Some(slot) => slot.1 = article,
            None => entries.push((pmid.to_string(), article)),
        }
    }
    PmidIndex { entries }
}

fn pmid_set(articles: &[Value]) -> HashSet<&str> {
    articles
        .iter()
        .filter_map(|a| a.get("pmid").and_then(Value::as_str))
        .filter(|p| !p.is_empty())
        .collect()
}

/// Field names whose values differ, sorted, with ignored fields dropped
/// from the comparison entirely.
fn changed_fields(old: &Value, new: &Value, ignore: &HashSet<&str>) -> Vec<String> {
    let empty = Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    let mut keys: Vec<&str> = old_map
        .keys()
        .chain(new_map.keys())
        .map(String::as_str)
        .filter(|key| !ignore.contains(key))
        .collect();
    keys.sort_unstable();
    keys.dedup();

    keys.into_iter()
        .filter(|key| old_map.get(*key) != new_map.get(*key))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(pmid: &str, title: &str) -> Value {
        json!({ "pmid": pmid, "title": title })
    }

    fn statuses(records: &[DiffRecord]) -> Vec<(String, String)> {
        records
            .iter()
            .map(|r| {
                (
                    r.pmid.clone(),
                    r.entry["status"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn identical_inputs_produce_no_records() {
        let articles = vec![article("1", "A"), article("2", "B")];
        assert!(diff_jsonl(&articles, &articles, &[]).is_empty());
    }

    #[test]
    fn buckets_come_out_removed_then_changed_then_added() {
        let old = vec![article("1", "A"), article("2", "B"), article("3", "C")];
        let new = vec![article("4", "D"), article("2", "B2"), article("3", "C")];

        let records = diff_jsonl(&old, &new, &[]);
        assert_eq!(
            statuses(&records),
            vec![
                ("1".to_string(), "removed".to_string()),
                ("2".to_string(), "changed".to_string()),
                ("4".to_string(), "added".to_string()),
            ]
        );
    }

    #[test]
    fn buckets_preserve_input_order_not_map_order() {
        let old = vec![
            article("9", "x"),
            article("2", "x"),
            article("5", "x"),
        ];
        let new: Vec<Value> = vec![article("7", "y"), article("1", "y")];

        let records = diff_jsonl(&old, &new, &[]);
        let pmids: Vec<&str> = records.iter().map(|r| r.pmid.as_str()).collect();
        // removed in old-input order, added in new-input order
        assert_eq!(pmids, vec!["9", "2", "5", "7", "1"]);
    }

    #[test]
    fn changed_record_names_the_fields_sorted() {
        let old = vec![json!({"pmid": "1", "title": "A", "year": 2020, "doi": "x"})];
        let new = vec![json!({"pmid": "1", "title": "B", "year": 2021, "doi": "x"})];

        let records = diff_jsonl(&old, &new, &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].entry["changed_fields"],
            json!(["title", "year"])
        );
        assert_eq!(records[0].entry["old"]["title"], "A");
        assert_eq!(records[0].entry["new"]["title"], "B");
    }

    #[test]
    fn ignored_fields_suppress_a_change() {
        let old = vec![json!({"pmid": "1", "title": "A", "abstract": "long"})];
        let new = vec![json!({"pmid": "1", "title": "A", "abstract": "longer"})];

        assert_eq!(diff_jsonl(&old, &new, &[]).len(), 1);
        assert!(diff_jsonl(&old, &new, &["abstract".to_string()]).is_empty());
    }

    #[test]
    fn duplicate_pmids_keep_last_value_first_position() {
        let old = vec![article("1", "first"), article("2", "B"), article("1", "last")];
        let new = vec![article("1", "last"), article("2", "B")];
        // the duplicate's final value matches new, so nothing changed
        assert!(diff_jsonl(&old, &new, &[]).is_empty());
    }

    #[test]
    fn entries_without_pmid_are_ignored() {
        let old = vec![json!({"title": "no pmid"}), json!("not an object")];
        let new = vec![article("1", "A")];
        let records = diff_jsonl(&old, &new, &[]);
        assert_eq!(statuses(&records), vec![("1".to_string(), "added".to_string())]);
    }

    #[test]
    fn summary_counts_all_buckets() {
        let old = vec![article("1", "A"), article("2", "B"), article("3", "C")];
        let new = vec![article("2", "B2"), article("3", "C"), article("4", "D")];

        let summary = diff_summary(&old, &new, &[]);
        assert_eq!(
            summary,
            DiffSummary {
                added: 1,
                removed: 1,
                changed: 1,
                unchanged: 1,
            }
        );
    }

    #[test]
    fn load_jsonl_filters_to_pmid_objects() {
        let temp = tempfile::tempdir().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(temp.path().join("articles.jsonl")).unwrap();
        std::fs::write(
            path.as_std_path(),
            "{\"pmid\":\"1\"}\nnot json\n{\"title\":\"no pmid\"}\n{\"pmid\":\"2\"}\n",
        )
        .unwrap();

        let articles = load_jsonl(&path).unwrap();
        assert_eq!(articles.len(), 2);

        let missing = camino::Utf8PathBuf::from_path_buf(temp.path().join("nope.jsonl")).unwrap();
        assert!(matches!(
            load_jsonl(&missing),
            Err(PmError::InputNotFound(_))
        ));
    }
}
