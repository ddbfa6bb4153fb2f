//! Search/replace patch application
//!
//! The patch output shape lets the completer change small spans without
//! restating the whole query. Matching is exact first, then
//! whitespace-normalized: completers routinely reflow the SQL they were
//! shown.

use serde::{Deserialize, Serialize};

use crate::utils::normalize_whitespace;

/// A single patch from the completer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlPatch {
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub replace: String,
    #[serde(default)]
    pub description: String,
}

/// Result of applying a patch list in order
#[derive(Debug, Clone, Default)]
pub struct PatchOutcome {
    pub sql: String,
    pub applied: Vec<SqlPatch>,
    pub failed: Vec<(SqlPatch, String)>,
}

/// Apply patches in order. Exact-match first; on miss, locate the span whose
/// normalized text equals the normalized search string.
pub fn apply_patches(sql: &str, patches: Vec<SqlPatch>) -> PatchOutcome {
    let mut outcome = PatchOutcome { sql: sql.to_string(), ..Default::default() };

    for patch in patches {
        if patch.search.is_empty() {
            outcome.failed.push((patch, "empty search string".to_string()));
            continue;
        }

        if let Some(pos) = outcome.sql.find(&patch.search) {
            outcome.sql.replace_range(pos..pos + patch.search.len(), &patch.replace);
            outcome.applied.push(patch);
            continue;
        }

        let normalized_search = normalize_whitespace(&patch.search);
        match find_normalized_span(&outcome.sql, &normalized_search) {
            Some((start, end)) => {
                outcome.sql.replace_range(start..end, &patch.replace);
                outcome.applied.push(patch);
            },
            None => {
                outcome.failed.push((patch, "search text not found".to_string()));
            },
        }
    }

    outcome
}

/// Find the byte span of `sql` whose whitespace-normalized form equals
/// `normalized_search`.
fn find_normalized_span(sql: &str, normalized_search: &str) -> Option<(usize, usize)> {
    let first_word = normalized_search.split_whitespace().next()?;
    let bytes = sql.as_bytes();
    let n = sql.len();

    let mut i = 0;
    while i < n {
        // Skip to the next non-whitespace position
        while i < n && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= n {
            break;
        }

        if sql[i..].starts_with(first_word) {
            // Grow the candidate until its normalized form matches or
            // overshoots the target length
            let mut j = i + first_word.len();
            loop {
                let candidate = normalize_whitespace(&sql[i..j]);
                if candidate == normalized_search {
                    return Some((i, j));
                }
                if candidate.len() > normalized_search.len() || j >= n {
                    break;
                }
                j += 1;
                while j < n && !sql.is_char_boundary(j) {
                    j += 1;
                }
            }
        }
        // Advance past the current word
        while i < n && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(search: &str, replace: &str) -> SqlPatch {
        SqlPatch { search: search.to_string(), replace: replace.to_string(), description: String::new() }
    }

    #[test]
    fn test_exact_match_applied_once() {
        let outcome = apply_patches("SELECT a FROM t WHERE a = 1", vec![patch("a = 1", "a = 2")]);
        assert_eq!(outcome.sql, "SELECT a FROM t WHERE a = 2");
        assert_eq!(outcome.applied.len(), 1);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn test_whitespace_normalized_match() {
        let sql = "SELECT a\nFROM   t\nWHERE a = 1";
        let outcome = apply_patches(sql, vec![patch("FROM t WHERE a = 1", "FROM t WHERE a = 2")]);
        assert!(outcome.sql.contains("a = 2"), "got: {}", outcome.sql);
        assert_eq!(outcome.applied.len(), 1);
    }

    #[test]
    fn test_patches_apply_in_order() {
        let outcome = apply_patches(
            "SELECT a FROM t",
            vec![patch("FROM t", "FROM t WHERE a > 0"), patch("a > 0", "a > 10")],
        );
        assert_eq!(outcome.sql, "SELECT a FROM t WHERE a > 10");
        assert_eq!(outcome.applied.len(), 2);
    }

    #[test]
    fn test_miss_recorded_not_fatal() {
        let outcome = apply_patches(
            "SELECT a FROM t",
            vec![patch("no such text", "x"), patch("SELECT a", "SELECT a, b")],
        );
        assert_eq!(outcome.sql, "SELECT a, b FROM t");
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.applied.len(), 1);
    }

    #[test]
    fn test_empty_search_rejected() {
        let outcome = apply_patches("SELECT 1", vec![patch("", "x")]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.sql, "SELECT 1");
    }
}
