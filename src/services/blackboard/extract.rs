//! Phase 1: extract blackboard entries from worker attempts
//!
//! Everything here is deterministic: status classification from the
//! benchmark record, error categorization by keyword, the "Changes:"
//! section mined from response text, and a 4-tier fallback for naming the
//! applied transforms.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{AttemptStatus, BlackboardEntry, WorkerAttempt};
use crate::services::registry::TransformRegistry;

use super::sql_diff::infer_transforms_from_sql_diff;

/// Classify a worker outcome into the status vocabulary
pub fn classify_worker(attempt: &WorkerAttempt) -> AttemptStatus {
    if attempt.error.is_some() {
        return AttemptStatus::Error;
    }
    let Some(validation) = &attempt.validation else {
        return AttemptStatus::Unvalidated;
    };
    if !validation.is_pass() {
        return match validation.status {
            crate::models::ValidationStatus::FailRows => AttemptStatus::Fail,
            _ => AttemptStatus::Error,
        };
    }
    if validation.speedup >= 2.0 {
        AttemptStatus::Win
    } else if validation.speedup >= 1.1 {
        AttemptStatus::Improved
    } else if validation.speedup >= 0.95 {
        AttemptStatus::Neutral
    } else {
        AttemptStatus::Regression
    }
}

/// Bucket an error message into a stable category
pub fn categorize_error(message: &str) -> &'static str {
    if message.is_empty() {
        return "unknown";
    }
    let lower = message.to_lowercase();
    if ["parser error", "syntax error", "unterminated"].iter().any(|k| lower.contains(k)) {
        "syntax"
    } else if ["binder error", "catalog error", "not found", "not in group by"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "semantic"
    } else if ["timeout", "timed out", "cancelled"].iter().any(|k| lower.contains(k)) {
        "timeout"
    } else if ["runtime error", "out of memory", "not implemented"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "execution"
    } else {
        "unknown"
    }
}

static CHANGES_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)changes?:\s*(.+?)(?:\nExpected|\n```|\n##|\z)").expect("static regex")
});

/// Extract the "Changes:" section from a worker response, capped at 500
/// chars
pub fn extract_changes_section(response_text: &str) -> Option<String> {
    if response_text.is_empty() {
        return None;
    }
    CHANGES_SECTION.captures(response_text).map(|caps| {
        let section = caps[1].trim();
        crate::utils::truncate_chars(section, 500)
    })
}

/// Strategy-name fallback for runs that predate structured assignments.
/// Deliberately small and lossy; tier 4 (SQL diff) covers the rest.
fn strategy_transform(strategy: &str) -> Option<&'static str> {
    match strategy {
        "conservative_predicate_pushdown" | "conservative_filter_pushdown" => Some("push_pred"),
        "conservative_early_reduction" => Some("multi_push_pred"),
        "moderate_date_isolation" => Some("date_cte_isolate"),
        "moderate_dimension_isolation" => Some("date_cte_isolate"),
        "aggressive_single_pass_restructure" => Some("consolidate_scans"),
        "aggressive_multi_cte_prefetch" | "aggressive_cte_restructure" => Some("materialize_cte"),
        "novel_correlation_elimination" => Some("correlated_to_cte"),
        "novel_structural_transform" => Some("or_to_union"),
        _ => None,
    }
}

/// 4-tier transform extraction:
/// assignment examples -> response-text scan -> strategy map -> SQL diff
pub fn extract_transforms(attempt: &WorkerAttempt, registry: &TransformRegistry) -> Vec<String> {
    // Tier 1: assigned transforms, filtered to known ids
    let assigned: Vec<String> = attempt
        .assigned_transforms
        .iter()
        .filter(|t| registry.contains(t))
        .cloned()
        .collect();
    if !assigned.is_empty() {
        return assigned;
    }

    // Tier 2: scan the response text for known transform ids
    if !attempt.response_text.is_empty() {
        let lower = attempt.response_text.to_lowercase();
        let mut found: Vec<String> = registry
            .all()
            .into_iter()
            .map(|t| t.id)
            .filter(|id| {
                Regex::new(&format!(r"\b{}\b", regex::escape(id)))
                    .map(|re| re.is_match(&lower))
                    .unwrap_or(false)
            })
            .collect();
        found.sort();
        if !found.is_empty() {
            return found;
        }
    }

    // Tier 3: strategy-name map
    if let Some(mapped) = strategy_transform(&attempt.strategy) {
        return vec![mapped.to_string()];
    }

    // Tier 4: structural SQL diff
    if !attempt.original_sql.is_empty() && !attempt.optimized_sql.is_empty() {
        return infer_transforms_from_sql_diff(&attempt.original_sql, &attempt.optimized_sql);
    }

    Vec::new()
}

/// Build the blackboard entry for one worker attempt
pub fn build_entry(
    attempt: &WorkerAttempt,
    run_name: &str,
    registry: &TransformRegistry,
) -> BlackboardEntry {
    let status = classify_worker(attempt);
    let transforms = extract_transforms(attempt, registry);
    let changes = extract_changes_section(&attempt.response_text);

    let error_message = attempt
        .error
        .clone()
        .or_else(|| attempt.validation.as_ref().and_then(|v| v.error.clone()));
    let error_category = match status {
        AttemptStatus::Error | AttemptStatus::Fail => {
            Some(categorize_error(error_message.as_deref().unwrap_or("")).to_string())
        },
        _ => None,
    };

    let speedup = attempt.validation.as_ref().map(|v| v.speedup).unwrap_or(0.0);
    let principle = transforms.first().cloned();

    let (what_worked, why_it_worked, what_failed, why_it_failed) = match status {
        AttemptStatus::Win | AttemptStatus::Improved => {
            let what = changes.clone().or_else(|| {
                principle.as_ref().map(|p| format!("Applied {p}"))
            });
            let why = principle
                .as_ref()
                .and_then(|p| registry.get(p))
                .map(|t| t.description);
            (what, why, None, None)
        },
        AttemptStatus::Regression | AttemptStatus::Error | AttemptStatus::Fail => {
            let what = error_message.clone().or_else(|| changes.clone());
            let why = match status {
                AttemptStatus::Fail => {
                    Some("rewrite changed query semantics".to_string())
                },
                AttemptStatus::Regression => changes.clone(),
                _ => error_message.clone(),
            };
            (None, None, what, why)
        },
        _ => (None, None, None, None),
    };

    BlackboardEntry {
        query_id: attempt.query_id.clone(),
        worker_id: attempt.worker_id,
        run_name: run_name.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        examples_used: attempt.examples_used.clone(),
        strategy: attempt.strategy.clone(),
        status,
        speedup,
        transforms_applied: transforms,
        error_category,
        error_messages: error_message.into_iter().collect(),
        what_worked,
        why_it_worked,
        what_failed,
        why_it_failed,
        principle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ValidationResult, ValidationStatus};

    fn attempt(speedup: f64, rows_match: bool) -> WorkerAttempt {
        WorkerAttempt {
            query_id: "q15".to_string(),
            worker_id: 1,
            strategy: String::new(),
            examples_used: vec![],
            assigned_transforms: vec![],
            response_text: String::new(),
            original_sql: String::new(),
            optimized_sql: String::new(),
            validation: Some(ValidationResult {
                status: if rows_match { ValidationStatus::Pass } else { ValidationStatus::FailRows },
                rows_match,
                checksum_match: rows_match,
                original_ms: 100.0,
                optimized_ms: 100.0 / speedup.max(0.01),
                speedup: if rows_match { speedup } else { 0.0 },
                original_rows: 10,
                optimized_rows: 10,
                error: None,
                config_variant: None,
            }),
            error: None,
        }
    }

    #[test]
    fn test_classify_buckets() {
        assert_eq!(classify_worker(&attempt(2.5, true)), AttemptStatus::Win);
        assert_eq!(classify_worker(&attempt(1.3, true)), AttemptStatus::Improved);
        assert_eq!(classify_worker(&attempt(1.0, true)), AttemptStatus::Neutral);
        assert_eq!(classify_worker(&attempt(0.7, true)), AttemptStatus::Regression);
        assert_eq!(classify_worker(&attempt(2.5, false)), AttemptStatus::Fail);

        let mut errored = attempt(1.0, true);
        errored.error = Some("connection lost".to_string());
        assert_eq!(classify_worker(&errored), AttemptStatus::Error);
    }

    #[test]
    fn test_categorize_error() {
        assert_eq!(categorize_error("Parser Error: unterminated string"), "syntax");
        assert_eq!(categorize_error("Binder Error: column x not found"), "semantic");
        assert_eq!(categorize_error("query timed out after 120s"), "timeout");
        assert_eq!(categorize_error("Out of Memory"), "execution");
        assert_eq!(categorize_error("something odd"), "unknown");
        assert_eq!(categorize_error(""), "unknown");
    }

    #[test]
    fn test_changes_section_extraction() {
        let text = "Rewrote the query.\n\nChanges: pushed the date filter into a CTE\n```sql\nSELECT 1\n```";
        assert_eq!(
            extract_changes_section(text).as_deref(),
            Some("pushed the date filter into a CTE")
        );
        assert!(extract_changes_section("no section here").is_none());
    }

    #[test]
    fn test_transform_extraction_tiers() {
        let registry = TransformRegistry::with_builtins();

        // Tier 1: assignment wins
        let mut a = attempt(2.0, true);
        a.assigned_transforms = vec!["or_to_union".to_string(), "bogus".to_string()];
        assert_eq!(extract_transforms(&a, &registry), vec!["or_to_union"]);

        // Tier 2: response text scan
        let mut b = attempt(2.0, true);
        b.response_text = "I applied date_cte_isolate and push_pred here.".to_string();
        assert_eq!(extract_transforms(&b, &registry), vec!["date_cte_isolate", "push_pred"]);

        // Tier 3: strategy map
        let mut c = attempt(2.0, true);
        c.strategy = "novel_correlation_elimination".to_string();
        assert_eq!(extract_transforms(&c, &registry), vec!["correlated_to_cte"]);

        // Tier 4: SQL diff
        let mut d = attempt(2.0, true);
        d.original_sql = "SELECT * FROM t WHERE a = 1 OR b = 2".to_string();
        d.optimized_sql =
            "SELECT * FROM t WHERE a = 1 UNION ALL SELECT * FROM t WHERE b = 2 AND a <> 1"
                .to_string();
        assert_eq!(extract_transforms(&d, &registry), vec!["or_to_union"]);
    }

    #[test]
    fn test_build_entry_win_fields() {
        let registry = TransformRegistry::with_builtins();
        let mut a = attempt(2.98, true);
        a.assigned_transforms = vec!["or_to_union".to_string()];
        a.response_text = "Changes: split the OR into UNION ALL branches".to_string();

        let entry = build_entry(&a, "run_1", &registry);
        assert_eq!(entry.status, AttemptStatus::Win);
        assert_eq!(entry.principle.as_deref(), Some("or_to_union"));
        assert!(entry.what_worked.as_deref().unwrap().contains("UNION ALL"));
        assert!(entry.why_it_worked.is_some());
        assert!(entry.what_failed.is_none());
    }

    #[test]
    fn test_build_entry_fail_fields() {
        let registry = TransformRegistry::with_builtins();
        let entry = build_entry(&attempt(2.0, false), "run_1", &registry);
        assert_eq!(entry.status, AttemptStatus::Fail);
        assert_eq!(entry.error_category.as_deref(), Some("unknown"));
        assert_eq!(entry.why_it_failed.as_deref(), Some("rewrite changed query semantics"));
    }
}
