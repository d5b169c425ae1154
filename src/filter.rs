use std::collections::HashSet;
use std::io::BufRead;
use std::sync::OnceLock;

use camino::Utf8Path;
use regex::Regex;
use serde_json::{Map, Value};

use crate::audit::{self, AuditEvent};
use crate::error::PmError;

/// Filter criteria for JSONL article records. All set criteria combine
/// with AND logic.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    /// Year filter string: `2024`, `2020-2024`, `2020-`, or `-2024`.
    pub year: Option<String>,
    /// Journal contains (case-insensitive).
    pub journal: Option<String>,
    /// Journal equals exactly.
    pub journal_exact: Option<String>,
    /// Any author contains (case-insensitive).
    pub author: Option<String>,
    /// Title contains (case-insensitive).
    pub title: Option<String>,
    /// PMID equals, or is in a comma-separated set.
    pub pmid: Option<String>,
    pub min_authors: Option<usize>,
    pub has_abstract: bool,
    pub has_doi: bool,
}

impl Criteria {
    /// The criteria as a JSON object for the audit trail, set fields only.
    fn to_json(&self) -> Value {
        let mut map = Map::new();
        if let Some(year) = &self.year {
            map.insert("year".to_string(), Value::from(year.as_str()));
        }
        if let Some(journal) = &self.journal {
            map.insert("journal".to_string(), Value::from(journal.as_str()));
        }
        if let Some(journal_exact) = &self.journal_exact {
            map.insert(
                "journal_exact".to_string(),
                Value::from(journal_exact.as_str()),
            );
        }
        if let Some(author) = &self.author {
            map.insert("author".to_string(), Value::from(author.as_str()));
        }
        if let Some(title) = &self.title {
            map.insert("title".to_string(), Value::from(title.as_str()));
        }
        if let Some(pmid) = &self.pmid {
            map.insert("pmid".to_string(), Value::from(pmid.as_str()));
        }
        if let Some(min_authors) = self.min_authors {
            map.insert("min_authors".to_string(), Value::from(min_authors as u64));
        }
        if self.has_abstract {
            map.insert("has_abstract".to_string(), Value::Bool(true));
        }
        if self.has_doi {
            map.insert("has_doi".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }

    fn compile(&self) -> Result<Compiled, PmError> {
        let year_range = self
            .year
            .as_deref()
            .map(parse_year_filter)
            .transpose()?;
        let pmid_set = self.pmid.as_deref().map(|spec| {
            spec.split(',')
                .map(|p| p.trim().to_string())
                .collect::<HashSet<_>>()
        });
        Ok(Compiled {
            criteria: self,
            year_range,
            pmid_set,
        })
    }
}

struct Compiled<'a> {
    criteria: &'a Criteria,
    year_range: Option<(Option<i64>, Option<i64>)>,
    pmid_set: Option<HashSet<String>>,
}

impl Compiled<'_> {
    fn matches(&self, article: &Value) -> bool {
        if !article.is_object() {
            return false;
        }
        if let Some(set) = &self.pmid_set {
            let pmid = article.get("pmid").and_then(Value::as_str).unwrap_or("");
            if !set.contains(pmid) {
                return false;
            }
        }
        if let Some((min, max)) = self.year_range
            && !matches_year(article, min, max)
        {
            return false;
        }
        if let Some(pattern) = self.criteria.journal.as_deref()
            && !contains_ci(article.get("journal"), pattern)
        {
            return false;
        }
        if let Some(value) = self.criteria.journal_exact.as_deref()
            && article.get("journal").and_then(Value::as_str) != Some(value)
        {
            return false;
        }
        if let Some(pattern) = self.criteria.author.as_deref()
            && !matches_author(article, pattern)
        {
            return false;
        }
        if let Some(pattern) = self.criteria.title.as_deref()
            && !contains_ci(article.get("title"), pattern)
        {
            return false;
        }
        if let Some(min_authors) = self.criteria.min_authors {
            let count = article
                .get("authors")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            if count < min_authors {
                return false;
            }
        }
        if self.criteria.has_abstract && !non_empty_string(article.get("abstract")) {
            return false;
        }
        if self.criteria.has_doi && !non_empty_string(article.get("doi")) {
            return false;
        }
        true
    }
}

/// Parse a year filter into an inclusive `(min, max)` range. Open ends
/// are `None`; a bare year bounds both ends.
pub fn parse_year_filter(spec: &str) -> Result<(Option<i64>, Option<i64>), PmError> {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    let shape = SHAPE.get_or_init(|| Regex::new(r"^\d*-?\d*$").expect("static regex"));

    let invalid = || PmError::InvalidYearFilter(spec.to_string());
    if spec.is_empty()
        || spec == "-"
        || !spec.chars().any(|c| c.is_ascii_digit())
        || !shape.is_match(spec)
    {
        return Err(invalid());
    }

    if let Some((low, high)) = spec.split_once('-') {
        let parse = |part: &str| -> Result<Option<i64>, PmError> {
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse::<i64>().map(Some).map_err(|_| invalid())
            }
        };
        Ok((parse(low)?, parse(high)?))
    } else {
        let year = spec.parse::<i64>().map_err(|_| invalid())?;
        Ok((Some(year), Some(year)))
    }
}

/// Missing or unparseable years never match a year filter.
fn matches_year(article: &Value, min: Option<i64>, max: Option<i64>) -> bool {
    let year = match article.get("year") {
        Some(Value::Number(n)) => n.as_i64(),
        // legacy JSONL files carry years as strings
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    let Some(year) = year else { return false };
    if let Some(min) = min
        && year < min
    {
        return false;
    }
    if let Some(max) = max
        && year > max
    {
        return false;
    }
    true
}

fn contains_ci(field: Option<&Value>, pattern: &str) -> bool {
    field
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase()
        .contains(&pattern.to_lowercase())
}

fn matches_author(article: &Value, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    article
        .get("authors")
        .and_then(Value::as_array)
        .is_some_and(|authors| {
            authors
                .iter()
                .filter_map(Value::as_str)
                .any(|author| author.to_lowercase().contains(&pattern))
        })
}

fn non_empty_string(field: Option<&Value>) -> bool {
    field.and_then(Value::as_str).is_some_and(|s| !s.is_empty())
}

/// Apply the criteria to a list of article records. Non-object entries
/// are dropped.
pub fn filter_articles(articles: &[Value], criteria: &Criteria) -> Result<Vec<Value>, PmError> {
    let compiled = criteria.compile()?;
    Ok(articles
        .iter()
        .filter(|article| compiled.matches(article))
        .cloned()
        .collect())
}

/// Filter and record screening stats (input, output, excluded, criteria)
/// in the audit trail. This is what the CLI calls; the counts feed PRISMA
/// flow diagrams.
pub fn filter_articles_audited(
    articles: Vec<Value>,
    criteria: &Criteria,
    root: Option<&Utf8Path>,
) -> Result<Vec<Value>, PmError> {
    let input = articles.len();
    let result = filter_articles(&articles, criteria)?;
    let output = result.len();

    audit::append(
        root,
        AuditEvent::new("filter")
            .field("input", input as u64)
            .field("output", output as u64)
            .field("excluded", (input - output) as u64)
            .field("criteria", criteria.to_json()),
    )?;

    Ok(result)
}

/// Parse JSONL from a reader, skipping blank and malformed lines.
pub fn read_jsonl(reader: impl BufRead) -> Result<Vec<Value>, PmError> {
    let mut articles = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|err| PmError::Filesystem(err.to_string()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            articles.push(value);
        }
    }
    Ok(articles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn article(pmid: &str, year: i64, journal: &str) -> Value {
        json!({
            "pmid": pmid,
            "year": year,
            "journal": journal,
            "authors": ["Smith J", "Jones A"],
            "title": format!("Study {pmid}"),
        })
    }

    #[test]
    fn year_filter_forms() {
        assert_eq!(parse_year_filter("2024").unwrap(), (Some(2024), Some(2024)));
        assert_eq!(
            parse_year_filter("2020-2024").unwrap(),
            (Some(2020), Some(2024))
        );
        assert_eq!(parse_year_filter("2020-").unwrap(), (Some(2020), None));
        assert_eq!(parse_year_filter("-2024").unwrap(), (None, Some(2024)));
    }

    #[test]
    fn year_filter_rejects_garbage() {
        for bad in ["", "-", "abc", "20a4", "2020--2024", "2020-2024-2025"] {
            assert_matches!(
                parse_year_filter(bad),
                Err(PmError::InvalidYearFilter(_)),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn year_range_is_inclusive_and_handles_string_years() {
        let criteria = Criteria {
            year: Some("2020-2024".to_string()),
            ..Criteria::default()
        };
        let articles = vec![
            article("1", 2019, "Nature"),
            article("2", 2020, "Nature"),
            json!({"pmid": "3", "year": "2024"}),
            json!({"pmid": "4", "year": "n/a"}),
            json!({"pmid": "5"}),
        ];
        let kept = filter_articles(&articles, &criteria).unwrap();
        let pmids: Vec<&str> = kept.iter().map(|a| a["pmid"].as_str().unwrap()).collect();
        assert_eq!(pmids, vec!["2", "3"]);
    }

    #[test]
    fn journal_contains_is_case_insensitive_and_exact_is_not() {
        let articles = vec![
            article("1", 2024, "Nature Medicine"),
            article("2", 2024, "Cell"),
        ];
        let contains = Criteria {
            journal: Some("nature".to_string()),
            ..Criteria::default()
        };
        assert_eq!(filter_articles(&articles, &contains).unwrap().len(), 1);

        let exact = Criteria {
            journal_exact: Some("nature medicine".to_string()),
            ..Criteria::default()
        };
        assert!(filter_articles(&articles, &exact).unwrap().is_empty());
    }

    #[test]
    fn author_substring_matches_any_author() {
        let criteria = Criteria {
            author: Some("jones".to_string()),
            ..Criteria::default()
        };
        let articles = vec![
            article("1", 2024, "Nature"),
            json!({"pmid": "2", "authors": ["Brown K"]}),
            json!({"pmid": "3"}),
        ];
        let kept = filter_articles(&articles, &criteria).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["pmid"], "1");
    }

    #[test]
    fn presence_filters_require_non_empty_values() {
        let criteria = Criteria {
            has_abstract: true,
            has_doi: true,
            ..Criteria::default()
        };
        let articles = vec![
            json!({"pmid": "1", "abstract": "text", "doi": "10.1/x"}),
            json!({"pmid": "2", "abstract": "", "doi": "10.1/y"}),
            json!({"pmid": "3", "abstract": "text"}),
        ];
        let kept = filter_articles(&articles, &criteria).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["pmid"], "1");
    }

    #[test]
    fn pmid_set_and_min_authors_combine_with_and() {
        let criteria = Criteria {
            pmid: Some("1, 3".to_string()),
            min_authors: Some(2),
            ..Criteria::default()
        };
        let articles = vec![
            article("1", 2024, "Nature"),
            article("2", 2024, "Nature"),
            json!({"pmid": "3", "authors": ["Solo A"]}),
        ];
        let kept = filter_articles(&articles, &criteria).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["pmid"], "1");
    }

    #[test]
    fn non_object_lines_are_dropped() {
        let articles = vec![json!("just a string"), json!(42), article("1", 2024, "N")];
        let kept = filter_articles(&articles, &Criteria::default()).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn read_jsonl_skips_blank_and_malformed_lines() {
        let input = "{\"pmid\":\"1\"}\n\nnot json\n{\"pmid\":\"2\"}\n";
        let articles = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[1]["pmid"], "2");
    }

    #[test]
    fn audited_filter_records_screening_stats() {
        let temp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let root = crate::store::init(&dir).unwrap();

        let criteria = Criteria {
            year: Some("2024".to_string()),
            has_doi: true,
            ..Criteria::default()
        };
        let articles = vec![
            json!({"pmid": "1", "year": 2024, "doi": "10.1/x"}),
            json!({"pmid": "2", "year": 2023, "doi": "10.1/y"}),
            json!({"pmid": "3", "year": 2024}),
        ];
        let kept = filter_articles_audited(articles, &criteria, Some(&root)).unwrap();
        assert_eq!(kept.len(), 1);

        let events = crate::audit::read_events(&root);
        let event = events.last().unwrap();
        assert_eq!(event["op"], "filter");
        assert_eq!(event["input"], 3);
        assert_eq!(event["output"], 1);
        assert_eq!(event["excluded"], 2);
        assert_eq!(event["criteria"]["year"], "2024");
        assert_eq!(event["criteria"]["has_doi"], true);
        assert!(event["criteria"].get("journal").is_none());
    }
}
