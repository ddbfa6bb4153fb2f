//! Per-query result and leaderboard model

use serde::{Deserialize, Serialize};

use super::knowledge::AttemptStatus;
use super::validation::ValidationResult;

/// One worker's optimization attempt, as persisted by the scheduler.
///
/// The blackboard mines these for knowledge after the cohort finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAttempt {
    pub query_id: String,
    pub worker_id: u32,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub examples_used: Vec<String>,
    /// Transforms from the assignment, when known up front
    #[serde(default)]
    pub assigned_transforms: Vec<String>,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub original_sql: String,
    #[serde(default)]
    pub optimized_sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    /// Infrastructure or completer error that pre-empted validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where a winning rewrite came from
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Provenance {
    #[serde(default)]
    pub run_name: String,
    #[serde(default)]
    pub transforms_applied: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub worker_id: Option<u32>,
}

/// Best result for one query, persisted as `result.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speedup: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_ms: Option<f64>,
    #[serde(default)]
    pub original_sql: String,
    #[serde(default)]
    pub optimized_sql: String,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn errored(query_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            status: AttemptStatus::Error,
            speedup: None,
            original_ms: None,
            optimized_ms: None,
            original_sql: String::new(),
            optimized_sql: String::new(),
            provenance: Provenance::default(),
            error: Some(error.into()),
        }
    }
}

/// One leaderboard row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub query_id: String,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speedup: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_ms: Option<f64>,
    #[serde(default)]
    pub transforms: Vec<String>,
}

/// Cohort leaderboard with summary counts, persisted as `leaderboard.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub benchmark: String,
    pub updated_at: String,
    pub status_counts: std::collections::BTreeMap<String, usize>,
    pub entries: Vec<LeaderboardEntry>,
}
