//! Validation result model
//!
//! Produced by the validator for every (original, candidate) pair: semantic
//! equivalence plus interleaved timing.

use serde::{Deserialize, Serialize};

/// Outcome of a correctness + timing validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Rows and checksum match, timing collected
    Pass,
    /// Row count or checksum mismatch (semantic error)
    FailRows,
    /// Engine rejected the candidate SQL
    FailError,
    /// Candidate exceeded the engine deadline
    Timeout,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::FailRows => "fail_rows",
            Self::FailError => "fail_error",
            Self::Timeout => "timeout",
        }
    }
}

/// Result of validating one candidate against the original query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub rows_match: bool,
    pub checksum_match: bool,
    pub original_ms: f64,
    pub optimized_ms: f64,
    /// original_ms / optimized_ms; infinity allowed on a zero denominator
    pub speedup: f64,
    pub original_rows: u64,
    pub optimized_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Winning session-config variant when config boost ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_variant: Option<String>,
}

impl ValidationResult {
    pub fn is_pass(&self) -> bool {
        self.status == ValidationStatus::Pass
    }

    /// Failure constructor used for engine errors and timeouts
    pub fn failed(status: ValidationStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            rows_match: false,
            checksum_match: false,
            original_ms: 0.0,
            optimized_ms: 0.0,
            speedup: 0.0,
            original_rows: 0,
            optimized_rows: 0,
            error: Some(error.into()),
            config_variant: None,
        }
    }
}
