//! Transform and opportunity data model
//!
//! A `Transform` is one named rewrite pattern (e.g. `or_to_union`) with the
//! metadata needed for detection, prior computation, and prompt building.

use serde::{Deserialize, Serialize};

/// Transform category for prior boosting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformCategory {
    /// Proven 2x+ speedups on benchmark queries
    HighValue,
    Standard,
}

impl TransformCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighValue => "high_value",
            Self::Standard => "standard",
        }
    }

    pub fn parse_category(s: &str) -> Self {
        match s {
            "high_value" => Self::HighValue,
            _ => Self::Standard,
        }
    }
}

/// A SQL rewrite pattern with detection and prompt metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    /// Canonical id (e.g. "push_pred"), unique across the registry
    pub id: String,
    /// Display code (e.g. "QT-OPT-001")
    pub code: String,
    pub name: String,
    pub description: String,
    /// How to detect this pattern (textual AST pattern description)
    pub trigger: String,
    /// How to rewrite (injected into completer prompts)
    pub rewrite_hint: String,
    /// Impact score 1-10, used as the baseline PUCT prior weight
    pub weight: u8,
    /// Benchmark queries where this transform proved out (e.g. ["Q15"])
    #[serde(default)]
    pub benchmark_queries: Vec<String>,
    #[serde(default = "default_category")]
    pub category: TransformCategory,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Measured average speedup across verified wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_speedup: Option<f64>,
}

fn default_category() -> TransformCategory {
    TransformCategory::Standard
}

fn default_enabled() -> bool {
    true
}

impl Transform {
    /// Format for injection into completer prompts
    pub fn to_prompt_context(&self) -> String {
        format!(
            "**{}** - {}\n  Trigger: {}\n  Rewrite: {}",
            self.code, self.name, self.trigger, self.rewrite_hint
        )
    }
}

/// A detected match of a transform against a specific SQL AST
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub transform_id: String,
    /// DAG node where the pattern was detected
    pub node_id: String,
    /// Structural evidence for the match (for logs and prompts)
    pub evidence: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip() {
        assert_eq!(TransformCategory::parse_category("high_value"), TransformCategory::HighValue);
        assert_eq!(TransformCategory::parse_category("standard"), TransformCategory::Standard);
        assert_eq!(TransformCategory::parse_category("bogus"), TransformCategory::Standard);
        assert_eq!(TransformCategory::HighValue.as_str(), "high_value");
    }

    #[test]
    fn test_transform_deserialization_defaults() {
        let json = r#"{
            "id": "or_to_union",
            "code": "QT-OPT-008",
            "name": "OR to UNION ALL",
            "description": "Split OR conditions into UNION ALL branches",
            "trigger": "WHERE with OR spanning different columns",
            "rewrite_hint": "Decompose each OR branch into its own query",
            "weight": 9
        }"#;
        let t: Transform = serde_json::from_str(json).unwrap();
        assert!(t.enabled);
        assert_eq!(t.category, TransformCategory::Standard);
        assert!(t.benchmark_queries.is_empty());
        assert!(t.avg_speedup.is_none());
    }
}
