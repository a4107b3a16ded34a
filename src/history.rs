use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::error::{Error, Result};
use crate::metrics::set_history_size;
use crate::validation::ValidationVerdict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "camelCase")]
pub enum RequestInput {
    Question(String),
    Sql(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub input: RequestInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationVerdict>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
}

impl HistoryEntry {
    pub fn new(input: RequestInput, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            input,
            resolved_sql: None,
            validation: None,
            outcome,
            row_count: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.resolved_sql = Some(sql.into());
        self
    }

    pub fn with_validation(mut self, verdict: ValidationVerdict) -> Self {
        self.validation = Some(verdict);
        self
    }

    pub fn with_row_count(mut self, row_count: usize) -> Self {
        self.row_count = Some(row_count);
        self
    }
}

struct HistoryLog {
    entries: Vec<HistoryEntry>,
    file: Option<File>,
}

/// Process-wide append-only log of query requests. Appends are serialized
/// by a single lock that also covers the optional JSON-lines file, so lines
/// from concurrent requests never interleave.
pub struct QueryHistory {
    log: Mutex<HistoryLog>,
}

impl Default for QueryHistory {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl QueryHistory {
    pub fn in_memory() -> Self {
        Self {
            log: Mutex::new(HistoryLog {
                entries: Vec::new(),
                file: None,
            }),
        }
    }

    /// Opens the configured JSON-lines file, replaying any entries already in
    /// it. Without a path the history lives in memory only.
    pub fn open(config: &HistoryConfig) -> Result<Self> {
        let Some(path) = config.path.as_deref() else {
            return Ok(Self::in_memory());
        };

        let entries = if path.exists() {
            load_entries(path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::Config(format!("Cannot open history file {:?}: {}", path, e)))?;

        info!(path = %path.display(), entries = entries.len(), "Query history opened");
        set_history_size(entries.len());

        Ok(Self {
            log: Mutex::new(HistoryLog {
                entries,
                file: Some(file),
            }),
        })
    }

    pub fn append(&self, entry: HistoryEntry) {
        let mut log = self.log.lock();

        if let Some(file) = log.file.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(|e| e.to_string())
                .and_then(|line| writeln!(file, "{}", line).map_err(|e| e.to_string()));
            if let Err(e) = written {
                warn!(entry_id = %entry.id, error = %e, "Failed to persist history entry");
            }
        }

        debug!(entry_id = %entry.id, success = entry.outcome.is_success(), "History entry appended");
        log.entries.push(entry);
        set_history_size(log.entries.len());
    }

    /// The most recent `limit` entries, oldest first. `None` returns all.
    pub fn entries(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let log = self.log.lock();
        let skip = limit.map_or(0, |n| log.entries.len().saturating_sub(n));
        log.entries[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.log.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Cannot read history file {:?}: {}", path, e)))?;

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line
            .map_err(|e| Error::Config(format!("Cannot read history file {:?}: {}", path, e)))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed history line"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::PolicyRule;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sql_entry(sql: &str) -> HistoryEntry {
        HistoryEntry::new(RequestInput::Sql(sql.to_string()), Outcome::Success)
            .with_sql(sql)
            .with_validation(ValidationVerdict::Accepted)
            .with_row_count(1)
    }

    #[test]
    fn test_append_and_entries() {
        let history = QueryHistory::in_memory();
        assert!(history.is_empty());
        history.append(sql_entry("SELECT 1"));
        history.append(sql_entry("SELECT 2"));
        history.append(sql_entry("SELECT 3"));

        assert_eq!(history.len(), 3);
        let last_two = history.entries(Some(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].resolved_sql.as_deref(), Some("SELECT 2"));
        assert_eq!(last_two[1].resolved_sql.as_deref(), Some("SELECT 3"));
        assert_eq!(history.entries(None).len(), 3);
        assert_eq!(history.entries(Some(10)).len(), 3);
    }

    #[test]
    fn test_entry_serialization() {
        let entry = HistoryEntry::new(
            RequestInput::Question("top customers".into()),
            Outcome::failure("forbidden keyword DROP is not allowed in read-only queries"),
        )
        .with_sql("DROP TABLE customers")
        .with_validation(ValidationVerdict::Rejected {
            rule: PolicyRule::ForbiddenKeyword,
            reason: "forbidden keyword DROP is not allowed in read-only queries".into(),
        });

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["input"]["type"], "question");
        assert_eq!(json["input"]["text"], "top customers");
        assert_eq!(json["resolvedSql"], "DROP TABLE customers");
        assert_eq!(json["validation"]["status"], "REJECTED");
        assert_eq!(json["validation"]["rule"], "forbidden_keyword");
        assert_eq!(json["outcome"]["status"], "failure");
        assert!(json.get("rowCount").is_none());
    }

    #[test]
    fn test_persists_and_reloads_json_lines() {
        let dir = TempDir::new().unwrap();
        let config = HistoryConfig {
            path: Some(dir.path().join("history.jsonl")),
        };

        {
            let history = QueryHistory::open(&config).unwrap();
            history.append(sql_entry("SELECT 1"));
            history.append(sql_entry("SELECT 2"));
        }

        let reopened = QueryHistory::open(&config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.entries(None)[1].resolved_sql.as_deref(),
            Some("SELECT 2")
        );

        reopened.append(sql_entry("SELECT 3"));
        let contents = std::fs::read_to_string(dir.path().join("history.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn test_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let good = serde_json::to_string(&sql_entry("SELECT 1")).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n{}\n", good, good)).unwrap();

        let history = QueryHistory::open(&HistoryConfig { path: Some(path) }).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_open_without_path_is_in_memory() {
        let history = QueryHistory::open(&HistoryConfig::default()).unwrap();
        history.append(sql_entry("SELECT 1"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let history = Arc::new(
            QueryHistory::open(&HistoryConfig {
                path: Some(path.clone()),
            })
            .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        history.append(sql_entry(&format!("SELECT {}", t * 100 + i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(history.len(), 200);
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed = contents
            .lines()
            .filter(|l| serde_json::from_str::<HistoryEntry>(l).is_ok())
            .count();
        assert_eq!(parsed, 200);
    }
}
