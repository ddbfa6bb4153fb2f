//! String helpers shared across the pipeline

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Collapse all whitespace runs to single spaces.
///
/// Used for no-op detection and patch matching, where the completer's
/// formatting must not count as a difference.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable hash of a SQL string, insensitive to whitespace.
///
/// MCTS uses this for cycle avoidance across transformed states.
pub fn sql_state_hash(sql: &str) -> String {
    let mut h = DefaultHasher::new();
    normalize_whitespace(sql).to_lowercase().hash(&mut h);
    format!("{:x}", h.finish())
}

/// Truncate to at most `max` chars, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("SELECT  *\n FROM\tt"), "SELECT * FROM t");
        assert_eq!(normalize_whitespace("  "), "");
    }

    #[test]
    fn test_state_hash_ignores_formatting() {
        let a = sql_state_hash("SELECT * FROM t WHERE a = 1");
        let b = sql_state_hash("select *\n  from t\n  where a = 1");
        let c = sql_state_hash("SELECT * FROM t WHERE a = 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 4), "abcd...");
        assert_eq!(truncate_chars("abc", 4), "abc");
    }
}
