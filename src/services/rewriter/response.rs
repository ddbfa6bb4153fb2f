//! Completer response parsing
//!
//! The completer is untrusted: responses may be clean JSON, JSON wrapped in
//! markdown fences, prose with an embedded object, or bare SQL. Everything
//! here returns Option and lets the applicator decide to retry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)```(?:json|sql)?\s*\n?(.*?)\n?```").expect("static regex")
});

/// Extract a JSON object from a completer response.
///
/// Tries fenced code blocks first, then the outermost brace span.
pub fn parse_json_response(response: &str) -> Option<Value> {
    let text = response.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = CODE_BLOCK.captures(text) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    if let Ok(v) = serde_json::from_str::<Value>(text) {
        if v.is_object() {
            return Some(v);
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok().filter(Value::is_object)
}

const SQL_PREFIXES: [&str; 26] = [
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "FROM", "WHERE",
    "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "GROUP", "ORDER", "HAVING", "UNION", "INTERSECT",
    "EXCEPT", "LIMIT", "CASE", "WHEN", "AND", "OR",
];

const PROSE_PREFIXES: [&str; 12] = [
    "here", "the optimized", "i ", "this ", "note:", "explanation:", "changes:", "result:", "#",
    "---", "***", ">",
];

/// Extract SQL from a free-form response: fenced block first, then a scan
/// for SQL-looking lines with prose stripped.
pub fn extract_sql(response: &str) -> Option<String> {
    let text = response.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = CODE_BLOCK.captures(text) {
        let sql = caps[1].trim();
        if !sql.is_empty() {
            return Some(sql.to_string());
        }
    }

    let mut sql_lines = Vec::new();
    let mut in_sql = false;
    for line in text.lines() {
        let stripped = line.trim();
        let lowered = stripped.to_lowercase();
        if PROSE_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            continue;
        }
        let upper = stripped.to_uppercase();
        let looks_like_sql = SQL_PREFIXES.iter().any(|p| upper.starts_with(p))
            || stripped.starts_with('(')
            || stripped.starts_with(')');
        if looks_like_sql || in_sql {
            sql_lines.push(line);
            in_sql = true;
        }
    }
    if !sql_lines.is_empty() {
        return Some(sql_lines.join("\n").trim().to_string());
    }

    let upper = text.to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        return Some(text.to_string());
    }
    None
}
