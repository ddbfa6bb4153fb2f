//! Validator - correctness and timing for candidate rewrites
//!
//! Correctness is row-count plus an order-insensitive checksum computed
//! engine-side. Timing interleaves original and candidate runs so cache
//! state and background load hit both sides equally, discards the first
//! round per side as warmup, and reports a trimmed mean.

use std::time::Duration;

use crate::models::{AttemptStatus, ValidationResult, ValidationStatus};

use super::runner::{QueryRunner, RunnerError};

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Interleaved rounds per side; 3 or 5
    pub rounds: usize,
    pub statement_timeout: Duration,
    /// SET LOCAL style variants, each benchmarked in its own block
    pub boost_variants: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            statement_timeout: Duration::from_secs(120),
            boost_variants: Vec::new(),
        }
    }
}

pub struct SqlValidator<'a> {
    runner: &'a dyn QueryRunner,
    config: ValidatorConfig,
}

impl<'a> SqlValidator<'a> {
    pub fn new(runner: &'a dyn QueryRunner, config: ValidatorConfig) -> Self {
        Self { runner, config }
    }

    /// Validate a candidate rewrite against the original query
    pub async fn validate(&self, original: &str, candidate: &str) -> ValidationResult {
        let deadline = self.config.statement_timeout;

        // Correctness first: one run of each side
        let original_stats = match self.runner.execute(original, deadline).await {
            Ok(stats) => stats,
            Err(e) => return failure_from(&e, "original"),
        };
        let candidate_stats = match self.runner.execute(candidate, deadline).await {
            Ok(stats) => stats,
            Err(e) => return failure_from(&e, "candidate"),
        };

        if original_stats.rows != candidate_stats.rows {
            return ValidationResult {
                status: ValidationStatus::FailRows,
                rows_match: false,
                checksum_match: false,
                original_ms: original_stats.elapsed_ms,
                optimized_ms: candidate_stats.elapsed_ms,
                speedup: 0.0,
                original_rows: original_stats.rows,
                optimized_rows: candidate_stats.rows,
                error: Some(format!(
                    "row count mismatch: {} vs {}",
                    original_stats.rows, candidate_stats.rows
                )),
                config_variant: None,
            };
        }

        let checksum_match = match self.compare_checksums(original, candidate, deadline).await {
            Ok(matched) => matched,
            Err(e) => return failure_from(&e, "checksum"),
        };
        if !checksum_match {
            return ValidationResult {
                status: ValidationStatus::FailRows,
                rows_match: true,
                checksum_match: false,
                original_ms: original_stats.elapsed_ms,
                optimized_ms: candidate_stats.elapsed_ms,
                speedup: 0.0,
                original_rows: original_stats.rows,
                optimized_rows: candidate_stats.rows,
                error: Some("checksum mismatch: same row count, different values".to_string()),
                config_variant: None,
            };
        }

        // Interleaved timing
        let (original_ms, optimized_ms) = match self.benchmark_pair(original, candidate).await {
            Ok(pair) => pair,
            Err(e) => return failure_from(&e, "timing"),
        };

        let mut best_ms = optimized_ms;
        let mut best_variant = None;

        // Config-boosted variants, each in its own interleaved block
        for variant in &self.config.boost_variants {
            if let Err(e) = self.runner.set_session(std::slice::from_ref(variant)).await {
                tracing::warn!("Config variant '{}' failed to apply: {}", variant, e);
                continue;
            }
            match self.benchmark_pair(original, candidate).await {
                Ok((_, variant_ms)) if variant_ms < best_ms => {
                    best_ms = variant_ms;
                    best_variant = Some(variant.clone());
                },
                Ok(_) => {},
                Err(e) => tracing::warn!("Config variant '{}' benchmark failed: {}", variant, e),
            }
        }
        if !self.config.boost_variants.is_empty() {
            if let Err(e) = self.runner.set_session(&["RESET ALL".to_string()]).await {
                tracing::warn!("Session reset failed: {}", e);
            }
        }

        let speedup = if best_ms == 0.0 { f64::INFINITY } else { original_ms / best_ms };

        ValidationResult {
            status: ValidationStatus::Pass,
            rows_match: true,
            checksum_match: true,
            original_ms,
            optimized_ms: best_ms,
            speedup,
            original_rows: original_stats.rows,
            optimized_rows: candidate_stats.rows,
            error: None,
            config_variant: best_variant,
        }
    }

    async fn compare_checksums(
        &self,
        original: &str,
        candidate: &str,
        deadline: Duration,
    ) -> Result<bool, RunnerError> {
        let a = self.runner.checksum(original, deadline).await?;
        let b = self.runner.checksum(candidate, deadline).await?;
        Ok(a == b)
    }

    /// Interleaved benchmark: R rounds of (original, candidate), the first
    /// round per side discarded as warmup. Returns trimmed means.
    async fn benchmark_pair(
        &self,
        original: &str,
        candidate: &str,
    ) -> Result<(f64, f64), RunnerError> {
        let deadline = self.config.statement_timeout;
        let rounds = self.config.rounds.max(2);

        let mut original_samples = Vec::with_capacity(rounds - 1);
        let mut candidate_samples = Vec::with_capacity(rounds - 1);

        for round in 0..rounds {
            let o = self.runner.execute(original, deadline).await?;
            let c = self.runner.execute(candidate, deadline).await?;
            if round == 0 {
                continue;
            }
            original_samples.push(o.elapsed_ms);
            candidate_samples.push(c.elapsed_ms);
        }

        Ok((
            trimmed_mean(&mut original_samples, rounds),
            trimmed_mean(&mut candidate_samples, rounds),
        ))
    }
}

/// Trimmed mean of timing samples: drop min and max when 5 rounds ran,
/// else a plain mean of the post-warmup samples.
fn trimmed_mean(samples: &mut [f64], rounds: usize) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let trimmed: &[f64] =
        if rounds >= 5 && samples.len() > 2 { &samples[1..samples.len() - 1] } else { samples };
    trimmed.iter().sum::<f64>() / trimmed.len() as f64
}

fn failure_from(error: &RunnerError, stage: &str) -> ValidationResult {
    match error {
        RunnerError::Timeout(ms) => ValidationResult::failed(
            ValidationStatus::Timeout,
            format!("{stage}: engine timeout after {ms}ms"),
        ),
        other => {
            ValidationResult::failed(ValidationStatus::FailError, format!("{stage}: {other}"))
        },
    }
}

/// Map a validation result to the stable status vocabulary.
///
/// WIN >= 2.0, IMPROVED >= 1.1, NEUTRAL >= 0.95, else REGRESSION;
/// FAIL on a semantic mismatch; ERROR on execution failures.
pub fn classify_status(result: &ValidationResult) -> AttemptStatus {
    match result.status {
        ValidationStatus::FailError | ValidationStatus::Timeout => AttemptStatus::Error,
        ValidationStatus::FailRows => AttemptStatus::Fail,
        ValidationStatus::Pass => {
            if result.speedup >= 2.0 {
                AttemptStatus::Win
            } else if result.speedup >= 1.1 {
                AttemptStatus::Improved
            } else if result.speedup >= 0.95 {
                AttemptStatus::Neutral
            } else {
                AttemptStatus::Regression
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runner::QueryStats;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scriptable engine: per-SQL row counts, checksums, and timings
    #[derive(Default)]
    struct FakeRunner {
        profiles: HashMap<String, (u64, i64, f64)>,
        fail_sql: Option<(String, RunnerError)>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn with(mut self, sql: &str, rows: u64, checksum: i64, time_ms: f64) -> Self {
            self.profiles.insert(sql.to_string(), (rows, checksum, time_ms));
            self
        }

        fn failing(mut self, sql: &str, error: RunnerError) -> Self {
            self.fail_sql = Some((sql.to_string(), error));
            self
        }
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn execute(&self, sql: &str, _deadline: Duration) -> Result<QueryStats, RunnerError> {
            self.calls.lock().unwrap().push(sql.to_string());
            if let Some((fail, err)) = &self.fail_sql {
                if sql == fail {
                    return Err(clone_error(err));
                }
            }
            let (rows, _, time_ms) = self
                .profiles
                .get(sql)
                .copied()
                .ok_or_else(|| RunnerError::Engine(format!("unknown sql: {sql}")))?;
            Ok(QueryStats { rows, elapsed_ms: time_ms })
        }

        async fn checksum(&self, sql: &str, _deadline: Duration) -> Result<i64, RunnerError> {
            let (_, checksum, _) = self
                .profiles
                .get(sql)
                .copied()
                .ok_or_else(|| RunnerError::Engine(format!("unknown sql: {sql}")))?;
            Ok(checksum)
        }

        async fn explain_analyze(&self, _sql: &str) -> Result<serde_json::Value, RunnerError> {
            Ok(serde_json::json!({"children": []}))
        }

        async fn set_session(&self, options: &[String]) -> Result<(), RunnerError> {
            self.calls.lock().unwrap().extend(options.iter().cloned());
            Ok(())
        }
    }

    fn clone_error(e: &RunnerError) -> RunnerError {
        match e {
            RunnerError::Timeout(ms) => RunnerError::Timeout(*ms),
            RunnerError::Engine(m) => RunnerError::Engine(m.clone()),
            RunnerError::Connection(m) => RunnerError::Connection(m.clone()),
        }
    }

    const ORIG: &str = "SELECT * FROM t";
    const CAND: &str = "SELECT * FROM t WHERE true";

    #[tokio::test]
    async fn test_pass_with_speedup() {
        let runner = FakeRunner::default().with(ORIG, 100, 42, 100.0).with(CAND, 100, 42, 40.0);
        let validator = SqlValidator::new(&runner, ValidatorConfig::default());
        let result = validator.validate(ORIG, CAND).await;

        assert_eq!(result.status, ValidationStatus::Pass);
        assert!(result.rows_match && result.checksum_match);
        assert!((result.speedup - 2.5).abs() < 1e-9);
        assert_eq!(classify_status(&result), AttemptStatus::Win);
    }

    #[tokio::test]
    async fn test_row_mismatch_fails() {
        let runner = FakeRunner::default().with(ORIG, 100, 42, 100.0).with(CAND, 99, 42, 40.0);
        let validator = SqlValidator::new(&runner, ValidatorConfig::default());
        let result = validator.validate(ORIG, CAND).await;

        assert_eq!(result.status, ValidationStatus::FailRows);
        assert!(!result.rows_match);
        assert_eq!(classify_status(&result), AttemptStatus::Fail);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let runner = FakeRunner::default().with(ORIG, 100, 42, 100.0).with(CAND, 100, 43, 40.0);
        let validator = SqlValidator::new(&runner, ValidatorConfig::default());
        let result = validator.validate(ORIG, CAND).await;

        assert_eq!(result.status, ValidationStatus::FailRows);
        assert!(result.rows_match);
        assert!(!result.checksum_match);
        assert_eq!(classify_status(&result), AttemptStatus::Fail);
    }

    #[tokio::test]
    async fn test_engine_error_maps_to_fail_error() {
        let runner = FakeRunner::default()
            .with(ORIG, 100, 42, 100.0)
            .failing(CAND, RunnerError::Engine("syntax error at WHERE".to_string()));
        let validator = SqlValidator::new(&runner, ValidatorConfig::default());
        let result = validator.validate(ORIG, CAND).await;

        assert_eq!(result.status, ValidationStatus::FailError);
        assert!(result.error.as_deref().unwrap().contains("syntax error"));
        assert_eq!(classify_status(&result), AttemptStatus::Error);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout() {
        let runner = FakeRunner::default()
            .with(ORIG, 100, 42, 100.0)
            .failing(CAND, RunnerError::Timeout(120_000));
        let validator = SqlValidator::new(&runner, ValidatorConfig::default());
        let result = validator.validate(ORIG, CAND).await;

        assert_eq!(result.status, ValidationStatus::Timeout);
        assert_eq!(classify_status(&result), AttemptStatus::Error);
    }

    #[tokio::test]
    async fn test_interleaved_round_count() {
        let runner = FakeRunner::default().with(ORIG, 10, 1, 50.0).with(CAND, 10, 1, 50.0);
        let validator = SqlValidator::new(&runner, ValidatorConfig::default());
        let _ = validator.validate(ORIG, CAND).await;

        // 1 correctness run per side + 3 interleaved rounds per side
        let calls = runner.calls.lock().unwrap();
        let orig_runs = calls.iter().filter(|s| s.as_str() == ORIG).count();
        let cand_runs = calls.iter().filter(|s| s.as_str() == CAND).count();
        assert_eq!(orig_runs, 4);
        assert_eq!(cand_runs, 4);
    }

    #[test]
    fn test_trimmed_mean_five_rounds_drops_extremes() {
        let mut samples = vec![10.0, 100.0, 12.0, 11.0];
        // 5 rounds -> 4 post-warmup samples -> drop min and max
        assert!((trimmed_mean(&mut samples, 5) - 11.5).abs() < 1e-9);

        let mut samples3 = vec![10.0, 20.0];
        assert!((trimmed_mean(&mut samples3, 3) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_classify_buckets() {
        let mut r = ValidationResult {
            status: ValidationStatus::Pass,
            rows_match: true,
            checksum_match: true,
            original_ms: 100.0,
            optimized_ms: 50.0,
            speedup: 2.0,
            original_rows: 1,
            optimized_rows: 1,
            error: None,
            config_variant: None,
        };
        assert_eq!(classify_status(&r), AttemptStatus::Win);
        r.speedup = 1.5;
        assert_eq!(classify_status(&r), AttemptStatus::Improved);
        r.speedup = 1.0;
        assert_eq!(classify_status(&r), AttemptStatus::Neutral);
        r.speedup = 0.5;
        assert_eq!(classify_status(&r), AttemptStatus::Regression);
    }
}
