//! Gold example model
//!
//! Gold examples are the retrieval units shown to the completer: verified
//! rewrites with measured speedups, one JSON file per transform under
//! `examples/<engine>/`.

use serde::{Deserialize, Serialize};

/// Whether an example demonstrates a rewrite to emulate or one to avoid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExampleClass {
    #[default]
    Standard,
    Regression,
}

/// One node-level rewrite inside an example
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteSet {
    pub id: String,
    pub transform: String,
    /// node_id -> rewritten SQL
    pub nodes: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub invariants_kept: Vec<String>,
    #[serde(default)]
    pub expected_speedup: String,
    #[serde(default)]
    pub risk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExampleOutput {
    #[serde(default)]
    pub rewrite_sets: Vec<RewriteSet>,
}

/// The structured worked example inside a gold example file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExampleBody {
    #[serde(default)]
    pub opportunity: String,
    #[serde(default)]
    pub input_slice: String,
    #[serde(default)]
    pub output: ExampleOutput,
    #[serde(default)]
    pub key_insight: String,
    #[serde(default)]
    pub when_not_to_use: String,
}

/// A verified rewrite used as few-shot guidance for the completer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldExample {
    /// Matches the transform id
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub benchmark_queries: Vec<String>,
    /// Stored as "2.98x" on disk
    #[serde(default)]
    pub verified_speedup: String,
    #[serde(default)]
    pub example: ExampleBody,
    #[serde(default)]
    pub example_class: ExampleClass,
    /// Full original SQL, kept for tag extraction and promotion comparisons
    #[serde(default)]
    pub original_sql: String,
    #[serde(default)]
    pub optimized_sql: String,
}

impl GoldExample {
    /// Parse "2.98x" (or a bare number) into a float, 0.0 on failure
    pub fn speedup_value(&self) -> f64 {
        self.verified_speedup.trim_end_matches('x').trim().parse().unwrap_or(0.0)
    }

    /// Format for injection into completer prompts
    pub fn to_prompt_section(&self) -> String {
        let mut lines = vec![format!(
            "### Example: {} ({} verified)",
            self.name, self.verified_speedup
        )];
        if !self.example.opportunity.is_empty() {
            lines.push(format!("Opportunity: {}", self.example.opportunity));
        }
        if !self.example.input_slice.is_empty() {
            lines.push(format!("Input:\n```sql\n{}\n```", self.example.input_slice.trim()));
        }
        for rs in &self.example.output.rewrite_sets {
            for (node, sql) in &rs.nodes {
                lines.push(format!("Rewrite `{}`:\n```sql\n{}\n```", node, sql.trim()));
            }
        }
        if !self.example.key_insight.is_empty() {
            lines.push(format!("Key insight: {}", self.example.key_insight));
        }
        if !self.example.when_not_to_use.is_empty() {
            lines.push(format!("When not to use: {}", self.example.when_not_to_use));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speedup_value_parsing() {
        let mut ex = GoldExample {
            id: "or_to_union".to_string(),
            name: "Or To Union".to_string(),
            description: String::new(),
            benchmark_queries: vec![],
            verified_speedup: "2.98x".to_string(),
            example: ExampleBody::default(),
            example_class: ExampleClass::Standard,
            original_sql: String::new(),
            optimized_sql: String::new(),
        };
        assert!((ex.speedup_value() - 2.98).abs() < 1e-9);

        ex.verified_speedup = "3.1".to_string();
        assert!((ex.speedup_value() - 3.1).abs() < 1e-9);

        ex.verified_speedup = "fast".to_string();
        assert_eq!(ex.speedup_value(), 0.0);
    }
}
