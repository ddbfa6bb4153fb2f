//! Blackboard and knowledge data model
//!
//! `BlackboardEntry` is the per-worker attempt record; principles and
//! anti-patterns are the collated generalizations; `GlobalKnowledge` is the
//! durable per-dataset file merged monotonically across runs.

use serde::{Deserialize, Serialize};

/// Attempt outcome bucket, derived from speedup and equivalence.
///
/// These strings appear in the leaderboard, blackboard, and promotion
/// records and are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptStatus {
    /// speedup >= 2.0
    Win,
    /// speedup >= 1.1
    Improved,
    /// speedup >= 0.95
    Neutral,
    Regression,
    /// Execution failed
    Error,
    /// Rows did not match (semantic mismatch)
    Fail,
    /// api-only mode: candidate produced but never benchmarked
    Unvalidated,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Improved => "IMPROVED",
            Self::Neutral => "NEUTRAL",
            Self::Regression => "REGRESSION",
            Self::Error => "ERROR",
            Self::Fail => "FAIL",
            Self::Unvalidated => "UNVALIDATED",
        }
    }

    pub fn parse_status(s: &str) -> Self {
        match s {
            "WIN" => Self::Win,
            "IMPROVED" => Self::Improved,
            "NEUTRAL" => Self::Neutral,
            "REGRESSION" => Self::Regression,
            "ERROR" => Self::Error,
            "FAIL" => Self::Fail,
            "UNVALIDATED" => Self::Unvalidated,
            _ => Self::Error,
        }
    }
}

/// Knowledge entry captured after each worker optimization attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub query_id: String,
    pub worker_id: u32,
    pub run_name: String,
    pub timestamp: String,

    // Context
    #[serde(default)]
    pub examples_used: Vec<String>,
    #[serde(default)]
    pub strategy: String,

    // Outcome
    pub status: AttemptStatus,
    pub speedup: f64,
    #[serde(default)]
    pub transforms_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(default)]
    pub error_messages: Vec<String>,

    // Knowledge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub what_worked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_it_worked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub what_failed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_it_failed: Option<String>,
    /// Implicated principle id (first known transform)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principle: Option<String>,
}

/// A verified optimization principle collated from WIN/IMPROVED entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgePrinciple {
    pub id: String,
    pub name: String,
    pub what: String,
    pub why: String,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub when_not: String,
    /// Sorted descending
    pub verified_speedups: Vec<f64>,
    pub avg_speedup: f64,
    pub queries: Vec<String>,
    #[serde(default)]
    pub transforms: Vec<String>,
}

/// A verified anti-pattern collated from REGRESSION/ERROR/FAIL entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeAntiPattern {
    pub id: String,
    pub name: String,
    pub mechanism: String,
    pub observed_regressions: Vec<f64>,
    pub queries: Vec<String>,
    #[serde(default)]
    pub avoid_when: String,
}

/// Durable per-dataset knowledge, merged monotonically across runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalKnowledge {
    pub dataset: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub source_runs: Vec<String>,
    #[serde(default)]
    pub principles: Vec<KnowledgePrinciple>,
    #[serde(default)]
    pub anti_patterns: Vec<KnowledgeAntiPattern>,
}

impl GlobalKnowledge {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            last_updated: String::new(),
            source_runs: Vec::new(),
            principles: Vec::new(),
            anti_patterns: Vec::new(),
        }
    }
}
