//! Phase 4: auto-promote verified winners to gold examples
//!
//! A (transform, query) candidate is promoted when its speedup clears the
//! bar, equivalence held, and it beats the speedup already recorded in the
//! transform's example file. Losing candidates never touch disk.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::models::{ExampleBody, ExampleClass, ExampleOutput, GoldExample, RewriteSet, WorkerAttempt};
use crate::services::registry::TransformRegistry;
use crate::utils::{load_json, truncate_chars, write_json_atomic};

use super::extract::{extract_changes_section, extract_transforms};

#[derive(Debug, Clone, Serialize)]
pub struct PromotionRecord {
    pub transform: String,
    pub query_id: String,
    pub speedup: f64,
    /// "create" or "update"
    pub action: String,
}

/// Promote qualifying winners into `examples_dir/<transform>.json`.
pub fn promote_winners(
    attempts: &[WorkerAttempt],
    examples_dir: &Path,
    registry: &TransformRegistry,
    min_speedup: f64,
) -> std::io::Result<Vec<PromotionRecord>> {
    // Existing verified speedups per transform
    let mut existing: BTreeMap<String, f64> = BTreeMap::new();
    if examples_dir.is_dir() {
        for entry in std::fs::read_dir(examples_dir)?.flatten() {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(example) = load_json::<GoldExample>(&entry.path()) {
                existing.insert(example.id.clone(), example.speedup_value());
            }
        }
    }

    // Collect candidates and keep the best per transform
    let mut best: BTreeMap<String, &WorkerAttempt> = BTreeMap::new();
    for attempt in attempts {
        let Some(validation) = &attempt.validation else { continue };
        if !validation.is_pass() || validation.speedup < min_speedup {
            continue;
        }
        if attempt.error.is_some()
            || attempt.original_sql.is_empty()
            || attempt.optimized_sql.is_empty()
        {
            continue;
        }
        let transforms = extract_transforms(attempt, registry);
        let Some(primary) = transforms.first() else { continue };

        let current_best = best
            .get(primary)
            .and_then(|a| a.validation.as_ref())
            .map(|v| v.speedup)
            .unwrap_or(0.0);
        if validation.speedup > current_best {
            best.insert(primary.clone(), attempt);
        }
    }

    let mut promoted = Vec::new();
    for (transform, attempt) in best {
        let validation = attempt.validation.as_ref().expect("filtered above");
        let speedup = validation.speedup;

        // Never downgrade an existing example
        if let Some(&recorded) = existing.get(&transform) {
            if recorded >= speedup {
                tracing::debug!(
                    "Skipping {}: existing example at {:.2}x >= {:.2}x",
                    transform,
                    recorded,
                    speedup
                );
                continue;
            }
        }

        let example = build_example(&transform, attempt, speedup, registry);
        std::fs::create_dir_all(examples_dir)?;
        write_json_atomic(&examples_dir.join(format!("{transform}.json")), &example)?;

        let action =
            if existing.contains_key(&transform) { "update" } else { "create" };
        tracing::info!(
            "Promoted {} from {} ({:.2}x, {})",
            transform,
            attempt.query_id,
            speedup,
            action
        );
        promoted.push(PromotionRecord {
            transform,
            query_id: attempt.query_id.clone(),
            speedup,
            action: action.to_string(),
        });
    }

    Ok(promoted)
}

fn build_example(
    transform: &str,
    attempt: &WorkerAttempt,
    speedup: f64,
    registry: &TransformRegistry,
) -> GoldExample {
    let kb = registry.get(transform);
    let changes = extract_changes_section(&attempt.response_text);
    let name = kb
        .as_ref()
        .map(|t| t.name.clone())
        .unwrap_or_else(|| transform.replace('_', " "));
    let qnum = attempt
        .query_id
        .trim_start_matches(|c: char| c.is_alphabetic() || c == '_')
        .to_uppercase();

    let mut nodes = BTreeMap::new();
    nodes.insert("main_query".to_string(), truncate_chars(&attempt.optimized_sql, 3000));

    GoldExample {
        id: transform.to_string(),
        name: name.clone(),
        description: changes
            .unwrap_or_else(|| format!("Apply the {name} optimization pattern")),
        benchmark_queries: vec![format!("Q{qnum}")],
        verified_speedup: format!("{speedup:.2}x"),
        example: ExampleBody {
            opportunity: transform.to_uppercase().replace('_', " "),
            input_slice: truncate_chars(&attempt.original_sql, 1000),
            output: ExampleOutput {
                rewrite_sets: vec![RewriteSet {
                    id: "rs_01".to_string(),
                    transform: transform.to_string(),
                    nodes,
                    invariants_kept: vec![
                        "same result values".to_string(),
                        "same column output".to_string(),
                    ],
                    expected_speedup: format!("{speedup:.2}x"),
                    risk: if speedup < 3.0 { "low".to_string() } else { "medium".to_string() },
                }],
            },
            key_insight: format!(
                "{} achieved {:.2}x on {}. {}",
                name,
                speedup,
                attempt.query_id,
                kb.as_ref().map(|t| t.description.clone()).unwrap_or_default()
            ),
            when_not_to_use: String::new(),
        },
        example_class: ExampleClass::Standard,
        original_sql: attempt.original_sql.clone(),
        optimized_sql: attempt.optimized_sql.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ValidationResult, ValidationStatus};

    fn winner(query: &str, transform: &str, speedup: f64) -> WorkerAttempt {
        WorkerAttempt {
            query_id: query.to_string(),
            worker_id: 1,
            strategy: String::new(),
            examples_used: vec![],
            assigned_transforms: vec![transform.to_string()],
            response_text: "Changes: isolated the date filter".to_string(),
            original_sql: "SELECT * FROM f JOIN date_dim d ON f.k = d.k WHERE d.y = 2001"
                .to_string(),
            optimized_sql: "WITH dates AS (SELECT k FROM date_dim WHERE y = 2001) \
                            SELECT * FROM f JOIN dates ON f.k = dates.k"
                .to_string(),
            validation: Some(ValidationResult {
                status: ValidationStatus::Pass,
                rows_match: true,
                checksum_match: true,
                original_ms: 310.0,
                optimized_ms: 100.0,
                speedup,
                original_rows: 10,
                optimized_rows: 10,
                error: None,
                config_variant: None,
            }),
            error: None,
        }
    }

    #[test]
    fn test_promotion_writes_example_file() {
        let dir = tempfile::tempdir().unwrap();
        let examples = dir.path().join("examples").join("duckdb");
        let registry = TransformRegistry::with_builtins();

        let attempts = vec![winner("q15", "date_cte_isolate", 3.1)];
        let promoted = promote_winners(&attempts, &examples, &registry, 2.0).unwrap();

        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].action, "create");

        let example: GoldExample =
            load_json(&examples.join("date_cte_isolate.json")).unwrap();
        assert_eq!(example.verified_speedup, "3.10x");
        assert_eq!(example.benchmark_queries, vec!["Q15"]);
        assert!(!example.example.output.rewrite_sets.is_empty());
    }

    #[test]
    fn test_no_write_when_existing_is_better() {
        let dir = tempfile::tempdir().unwrap();
        let examples = dir.path().join("examples").join("duckdb");
        let registry = TransformRegistry::with_builtins();

        let first = vec![winner("q15", "date_cte_isolate", 3.1)];
        promote_winners(&first, &examples, &registry, 2.0).unwrap();
        let before = std::fs::read_to_string(examples.join("date_cte_isolate.json")).unwrap();

        // Weaker candidate: no write occurs
        let weaker = vec![winner("q6", "date_cte_isolate", 2.5)];
        let promoted = promote_winners(&weaker, &examples, &registry, 2.0).unwrap();
        assert!(promoted.is_empty());
        let after = std::fs::read_to_string(examples.join("date_cte_isolate.json")).unwrap();
        assert_eq!(before, after);

        // Stronger candidate: file is updated
        let stronger = vec![winner("q6", "date_cte_isolate", 4.0)];
        let promoted = promote_winners(&stronger, &examples, &registry, 2.0).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].action, "update");
        let example: GoldExample =
            load_json(&examples.join("date_cte_isolate.json")).unwrap();
        assert_eq!(example.benchmark_queries, vec!["Q6"]);
    }

    #[test]
    fn test_below_bar_and_failed_not_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let examples = dir.path().join("examples").join("duckdb");
        let registry = TransformRegistry::with_builtins();

        let mut slow = winner("q1", "push_pred", 1.5);
        let mut failed = winner("q2", "or_to_union", 5.0);
        if let Some(v) = failed.validation.as_mut() {
            v.status = ValidationStatus::FailRows;
            v.rows_match = false;
        }
        slow.worker_id = 2;

        let promoted = promote_winners(&[slow, failed], &examples, &registry, 2.0).unwrap();
        assert!(promoted.is_empty());
        assert!(!examples.join("push_pred.json").exists());
        assert!(!examples.join("or_to_union.json").exists());
    }

    #[test]
    fn test_best_candidate_per_transform_wins() {
        let dir = tempfile::tempdir().unwrap();
        let examples = dir.path().join("examples").join("duckdb");
        let registry = TransformRegistry::with_builtins();

        let attempts =
            vec![winner("q15", "date_cte_isolate", 2.1), winner("q6", "date_cte_isolate", 2.9)];
        let promoted = promote_winners(&attempts, &examples, &registry, 2.0).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].query_id, "q6");
    }
}
