//! Phase 2: collate raw entries into principles and anti-patterns

use std::collections::BTreeMap;

use crate::models::{AttemptStatus, BlackboardEntry, KnowledgeAntiPattern, KnowledgePrinciple};
use crate::services::registry::TransformRegistry;

fn title_case(id: &str) -> String {
    id.split('_')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collate entries into principles (from WIN + IMPROVED) and anti-patterns
/// (from REGRESSION + ERROR + FAIL).
pub fn collate(
    entries: &[BlackboardEntry],
    registry: &TransformRegistry,
) -> (Vec<KnowledgePrinciple>, Vec<KnowledgeAntiPattern>) {
    let win_entries: Vec<&BlackboardEntry> = entries
        .iter()
        .filter(|e| matches!(e.status, AttemptStatus::Win | AttemptStatus::Improved))
        .collect();

    let regression_entries: Vec<&BlackboardEntry> =
        entries.iter().filter(|e| e.status == AttemptStatus::Regression).collect();

    // Regressions per transform, cross-referenced into when_not
    let mut regressions_by_transform: BTreeMap<&str, Vec<&BlackboardEntry>> = BTreeMap::new();
    for entry in &regression_entries {
        for transform in &entry.transforms_applied {
            regressions_by_transform.entry(transform).or_default().push(entry);
        }
    }

    // Principle = first known transform
    let mut principle_groups: BTreeMap<String, Vec<&BlackboardEntry>> = BTreeMap::new();
    for entry in &win_entries {
        let key = entry
            .principle
            .clone()
            .or_else(|| entry.transforms_applied.first().cloned())
            .unwrap_or_else(|| "unknown".to_string());
        principle_groups.entry(key).or_default().push(entry);
    }

    let mut principles = Vec::new();
    for (id, group) in &principle_groups {
        let mut speedups: Vec<f64> = group.iter().map(|e| e.speedup).collect();
        speedups.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let avg_speedup = speedups.iter().sum::<f64>() / speedups.len() as f64;

        let mut queries: Vec<String> = group.iter().map(|e| e.query_id.clone()).collect();
        queries.sort();
        queries.dedup();

        let mut transforms: Vec<String> =
            group.iter().flat_map(|e| e.transforms_applied.iter().cloned()).collect();
        transforms.sort();
        transforms.dedup();

        // Best what/why from the highest-speedup entry
        let best = group
            .iter()
            .max_by(|a, b| a.speedup.partial_cmp(&b.speedup).unwrap_or(std::cmp::Ordering::Equal))
            .expect("group is non-empty");
        let kb = registry.get(id);
        let what = best
            .what_worked
            .clone()
            .unwrap_or_else(|| format!("Applied {id}"));
        let why = best
            .why_it_worked
            .clone()
            .or_else(|| kb.as_ref().map(|t| t.description.clone()))
            .unwrap_or_default();
        let when = kb.as_ref().map(|t| t.trigger.clone()).unwrap_or_default();

        let mut when_not_parts = Vec::new();
        if let Some(regressions) = regressions_by_transform.get(id.as_str()) {
            let mut reg_queries: Vec<String> =
                regressions.iter().map(|e| e.query_id.clone()).collect();
            reg_queries.sort();
            reg_queries.dedup();
            let worst = regressions
                .iter()
                .map(|e| e.speedup)
                .fold(f64::INFINITY, f64::min);
            when_not_parts.push(format!(
                "Caused regression on {} (worst: {:.2}x)",
                reg_queries.join(", "),
                worst
            ));
            if let Some(reason) = regressions.iter().find_map(|e| e.why_it_failed.clone()) {
                when_not_parts.push(crate::utils::truncate_chars(&reason, 200));
            }
        }

        principles.push(KnowledgePrinciple {
            id: id.clone(),
            name: title_case(id),
            what: crate::utils::truncate_chars(&what, 500),
            why: crate::utils::truncate_chars(&why, 500),
            when,
            when_not: when_not_parts.join("; "),
            verified_speedups: speedups,
            avg_speedup: (avg_speedup * 1000.0).round() / 1000.0,
            queries,
            transforms,
        });
    }
    principles.sort_by(|a, b| {
        b.avg_speedup.partial_cmp(&a.avg_speedup).unwrap_or(std::cmp::Ordering::Equal)
    });

    // Anti-patterns
    let mut anti_patterns = Vec::new();

    // Regressions grouped by first transform
    let mut regression_groups: BTreeMap<String, Vec<&BlackboardEntry>> = BTreeMap::new();
    for entry in &regression_entries {
        let key = entry
            .transforms_applied
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown_regression".to_string());
        regression_groups.entry(key).or_default().push(entry);
    }
    for (key, group) in &regression_groups {
        let mut speedups: Vec<f64> = group.iter().map(|e| e.speedup).collect();
        speedups.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut queries: Vec<String> = group.iter().map(|e| e.query_id.clone()).collect();
        queries.sort();
        queries.dedup();
        let worst = group
            .iter()
            .min_by(|a, b| a.speedup.partial_cmp(&b.speedup).unwrap_or(std::cmp::Ordering::Equal))
            .expect("group is non-empty");
        let mechanism = worst
            .why_it_failed
            .clone()
            .or_else(|| worst.what_failed.clone())
            .unwrap_or_else(|| format!("Regression from {key}"));

        anti_patterns.push(KnowledgeAntiPattern {
            id: format!("regression_{key}"),
            name: format!("Regression: {}", title_case(key)),
            mechanism: crate::utils::truncate_chars(&mechanism, 500),
            observed_regressions: speedups,
            queries: queries.clone(),
            avoid_when: format!("Applying {} to queries similar to {}", key, queries.join(", ")),
        });
    }

    // Errors grouped by category
    let error_entries: Vec<&BlackboardEntry> =
        entries.iter().filter(|e| e.status == AttemptStatus::Error).collect();
    let mut error_groups: BTreeMap<String, Vec<&BlackboardEntry>> = BTreeMap::new();
    for entry in &error_entries {
        let key = entry.error_category.clone().unwrap_or_else(|| "unknown".to_string());
        error_groups.entry(key).or_default().push(entry);
    }
    for (key, group) in &error_groups {
        let mut queries: Vec<String> = group.iter().map(|e| e.query_id.clone()).collect();
        queries.sort();
        queries.dedup();
        let sample = group
            .iter()
            .max_by_key(|e| e.error_messages.first().map(String::len).unwrap_or(0))
            .expect("group is non-empty");
        let mechanism = sample
            .what_failed
            .clone()
            .unwrap_or_else(|| format!("Error category: {key}"));

        anti_patterns.push(KnowledgeAntiPattern {
            id: format!("error_{key}"),
            name: format!("Error Pattern: {}", title_case(key)),
            mechanism: crate::utils::truncate_chars(&mechanism, 500),
            observed_regressions: vec![0.0; group.len()],
            queries,
            avoid_when: format!(
                "Watch for {key} errors when rewriting queries with complex joins or aliases"
            ),
        });
    }

    // Semantic mismatches grouped by first transform
    let fail_entries: Vec<&BlackboardEntry> =
        entries.iter().filter(|e| e.status == AttemptStatus::Fail).collect();
    let mut fail_groups: BTreeMap<String, Vec<&BlackboardEntry>> = BTreeMap::new();
    for entry in &fail_entries {
        let key = entry
            .transforms_applied
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        fail_groups.entry(key).or_default().push(entry);
    }
    for (key, group) in &fail_groups {
        let mut queries: Vec<String> = group.iter().map(|e| e.query_id.clone()).collect();
        queries.sort();
        queries.dedup();

        anti_patterns.push(KnowledgeAntiPattern {
            id: format!("semantic_mismatch_{key}"),
            name: format!("Semantic Mismatch: {}", title_case(key)),
            mechanism: "Rewrite changed query semantics: different row counts or values returned"
                .to_string(),
            observed_regressions: vec![0.0; group.len()],
            queries,
            avoid_when: format!(
                "Applying {key} to queries where semantic equivalence is hard to verify"
            ),
        });
    }

    (principles, anti_patterns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        query: &str,
        status: AttemptStatus,
        speedup: f64,
        transforms: &[&str],
    ) -> BlackboardEntry {
        BlackboardEntry {
            query_id: query.to_string(),
            worker_id: 1,
            run_name: "run_1".to_string(),
            timestamp: String::new(),
            examples_used: vec![],
            strategy: String::new(),
            status,
            speedup,
            transforms_applied: transforms.iter().map(|t| t.to_string()).collect(),
            error_category: matches!(status, AttemptStatus::Error)
                .then(|| "timeout".to_string()),
            error_messages: vec![],
            what_worked: None,
            why_it_worked: None,
            what_failed: None,
            why_it_failed: None,
            principle: transforms.first().map(|t| t.to_string()),
        }
    }

    #[test]
    fn test_principles_from_wins_sorted_by_avg() {
        let registry = TransformRegistry::with_builtins();
        let entries = vec![
            entry("q1", AttemptStatus::Win, 2.8, &["correlated_to_cte"]),
            entry("q15", AttemptStatus::Win, 2.98, &["or_to_union"]),
            entry("q2", AttemptStatus::Improved, 1.2, &["or_to_union"]),
        ];
        let (principles, _) = collate(&entries, &registry);

        assert_eq!(principles.len(), 2);
        // correlated_to_cte avg 2.8 > or_to_union avg 2.09
        assert_eq!(principles[0].id, "correlated_to_cte");
        let or_p = principles.iter().find(|p| p.id == "or_to_union").unwrap();
        assert_eq!(or_p.verified_speedups, vec![2.98, 1.2]);
        assert_eq!(or_p.queries, vec!["q15", "q2"]);
        assert!((or_p.avg_speedup - 2.09).abs() < 1e-9);
        assert!(!or_p.when.is_empty());
    }

    #[test]
    fn test_when_not_from_co_transform_regressions() {
        let registry = TransformRegistry::with_builtins();
        let entries = vec![
            entry("q1", AttemptStatus::Win, 2.5, &["inline_cte"]),
            entry("q7", AttemptStatus::Regression, 0.6, &["inline_cte"]),
        ];
        let (principles, anti_patterns) = collate(&entries, &registry);

        assert_eq!(principles[0].id, "inline_cte");
        assert!(principles[0].when_not.contains("q7"));
        assert!(principles[0].when_not.contains("0.60x"));

        let reg = anti_patterns.iter().find(|a| a.id == "regression_inline_cte").unwrap();
        assert_eq!(reg.queries, vec!["q7"]);
        assert_eq!(reg.observed_regressions, vec![0.6]);
    }

    #[test]
    fn test_error_and_fail_anti_patterns() {
        let registry = TransformRegistry::with_builtins();
        let entries = vec![
            entry("q3", AttemptStatus::Error, 0.0, &["push_pred"]),
            entry("q4", AttemptStatus::Fail, 0.0, &["flatten_subq"]),
            entry("q5", AttemptStatus::Fail, 0.0, &["flatten_subq"]),
        ];
        let (principles, anti_patterns) = collate(&entries, &registry);

        assert!(principles.is_empty());
        assert!(anti_patterns.iter().any(|a| a.id == "error_timeout"));
        let mismatch =
            anti_patterns.iter().find(|a| a.id == "semantic_mismatch_flatten_subq").unwrap();
        assert_eq!(mismatch.queries, vec!["q4", "q5"]);
        assert_eq!(mismatch.observed_regressions.len(), 2);
    }
}
