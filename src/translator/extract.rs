use regex::Regex;
use std::sync::LazyLock;

static SQL_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*sql[ \t]*\r?\n?(.*?)(?:```|\z)").expect("SQL_FENCE pattern is valid")
});

static SELECT_ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSELECT\b").expect("SELECT_ANCHOR pattern is valid")
});

static WITH_ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWITH\s+`?\w+`?\s+AS\s*\(").expect("WITH_ANCHOR pattern is valid")
});

static HAS_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(SELECT|WITH)\b").expect("HAS_QUERY pattern is valid")
});

const LANGUAGE_TAGS: &[&str] = &["sql", "bigquery", "googlesql", "postgresql", "mysql"];

/// Pulls the first SQL statement out of a model response. Tried in order:
/// a ```sql fence, any fence whose body mentions SELECT or WITH, then a bare
/// SELECT/WITH anchor running to the first blank line or sentence end.
pub fn extract_sql(response: &str) -> Option<String> {
    if let Some(caps) = SQL_FENCE.captures(response) {
        let body = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        if !body.is_empty() {
            return Some(body.to_string());
        }
    }

    if response.contains("```") {
        for block in response.split("```").skip(1).step_by(2) {
            if HAS_QUERY.is_match(block) {
                let body = strip_language_tag(block).trim();
                if !body.is_empty() {
                    return Some(body.to_string());
                }
            }
        }
    }

    let start = [SELECT_ANCHOR.find(response), WITH_ANCHOR.find(response)]
        .into_iter()
        .flatten()
        .map(|m| m.start())
        .min()?;

    let tail = &response[start..];
    let end = ["\n\n", "\r\n\r\n", ". ", ".\n"]
        .iter()
        .filter_map(|sep| tail.find(sep))
        .min()
        .unwrap_or(tail.len());

    let sql = tail[..end].trim().trim_end_matches('.').trim();
    (!sql.is_empty()).then(|| sql.to_string())
}

fn strip_language_tag(block: &str) -> &str {
    let trimmed = block.trim_start();
    let first_line_end = trimmed.find('\n').unwrap_or(trimmed.len());
    let first = trimmed[..first_line_end].trim();
    if LANGUAGE_TAGS.iter().any(|t| first.eq_ignore_ascii_case(t)) {
        &trimmed[first_line_end..]
    } else {
        trimmed
    }
}
