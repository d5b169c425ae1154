use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;

use camino::Utf8Path;
use serde_json::Value;

use crate::error::PmError;
use crate::store::AUDIT_FILE;

/// One operation record destined for `audit.jsonl`. The logger stamps
/// `ts` at write time; a caller-supplied `ts` field is overwritten.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    op: String,
    fields: Vec<(String, Value)>,
}

impl AuditEvent {
    pub fn new(op: &str) -> Self {
        Self {
            op: op.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }
}

/// Current UTC time, second precision, ISO-8601 with `Z` suffix.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Append one event as a single line. The line is written with one write
/// call against an O_APPEND handle, so concurrent appenders from separate
/// processes each land a whole, uninterleaved line.
pub fn append(root: Option<&Utf8Path>, event: AuditEvent) -> Result<(), PmError> {
    let Some(root) = root else {
        return Ok(());
    };

    let mut object = serde_json::Map::new();
    object.insert("op".to_string(), Value::String(event.op));
    for (key, value) in event.fields {
        object.insert(key, value);
    }
    object.insert("ts".to_string(), Value::String(utc_timestamp()));

    let mut line = serde_json::to_string(&Value::Object(object))
        .map_err(|err| PmError::Audit(err.to_string()))?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(root.join(AUDIT_FILE).as_std_path())
        .map_err(|err| PmError::Audit(err.to_string()))?;
    file.write_all(line.as_bytes())
        .map_err(|err| PmError::Audit(err.to_string()))?;
    Ok(())
}

/// All parseable events in file order. Lines that are blank or fail to
/// parse as JSON are skipped; one corrupt line never hides the rest.
pub fn read_events(root: &Utf8Path) -> Vec<Value> {
    let Ok(content) = fs::read_to_string(root.join(AUDIT_FILE).as_std_path()) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str::<Value>(line).ok()
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub total_events: usize,
    pub by_op: BTreeMap<String, usize>,
}

pub fn summary(root: &Utf8Path) -> Summary {
    let events = read_events(root);
    let mut by_op = BTreeMap::new();
    for event in &events {
        let op = event
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        *by_op.entry(op).or_insert(0) += 1;
    }
    Summary {
        total_events: events.len(),
        by_op,
    }
}

pub fn searches(root: &Utf8Path) -> Vec<Value> {
    read_events(root)
        .into_iter()
        .filter(|event| event.get("op").and_then(Value::as_str) == Some("search"))
        .collect()
}

pub fn format_summary(summary: &Summary) -> String {
    let mut lines = vec![
        "Audit Trail Summary".to_string(),
        "===================".to_string(),
        String::new(),
    ];
    if summary.total_events == 0 {
        lines.push("No operations recorded.".to_string());
        return lines.join("\n");
    }
    lines.push(format!("Total operations: {}", summary.total_events));
    lines.push(String::new());
    for (op, count) in &summary.by_op {
        lines.push(format!("  {op:12} {count:>5}"));
    }
    lines.join("\n")
}

pub fn format_searches(searches: &[Value]) -> String {
    let mut lines = vec![
        "Search History".to_string(),
        "==============".to_string(),
        String::new(),
    ];
    if searches.is_empty() {
        lines.push("No searches recorded.".to_string());
        return lines.join("\n");
    }
    for event in searches {
        let query = event.get("query").and_then(Value::as_str).unwrap_or("?");
        let count = event
            .get("count")
            .and_then(Value::as_u64)
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        let ts = event.get("ts").and_then(Value::as_str).unwrap_or("?");
        // ts is arbitrary field content; never slice inside a char
        let date = ts.get(..10).unwrap_or(ts);
        let cached = event
            .get("cached")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let marker = if cached { " (cached)" } else { "" };
        lines.push(format!("  [{date}] \"{query}\" -> {count} PMIDs{marker}"));
    }
    lines.join("\n")
}
