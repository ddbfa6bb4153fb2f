//! Phase 3: merge collated knowledge into the durable per-dataset file
//!
//! The merge is monotone: speedup and query sets only grow, text fields
//! prefer the longer version, and avg_speedup is recomputed over the merged
//! list.

use std::collections::BTreeMap;

use crate::models::{GlobalKnowledge, KnowledgeAntiPattern, KnowledgePrinciple};

/// Merge new principles and anti-patterns into existing knowledge.
pub fn merge_knowledge(
    mut existing: GlobalKnowledge,
    principles: Vec<KnowledgePrinciple>,
    anti_patterns: Vec<KnowledgeAntiPattern>,
    run_name: &str,
) -> GlobalKnowledge {
    let mut by_id: BTreeMap<String, KnowledgePrinciple> =
        existing.principles.drain(..).map(|p| (p.id.clone(), p)).collect();

    for new in principles {
        match by_id.remove(&new.id) {
            Some(old) => {
                let merged = merge_principle(old, new);
                by_id.insert(merged.id.clone(), merged);
            },
            None => {
                by_id.insert(new.id.clone(), new);
            },
        }
    }

    let mut merged_principles: Vec<KnowledgePrinciple> = by_id.into_values().collect();
    merged_principles.sort_by(|a, b| {
        b.avg_speedup.partial_cmp(&a.avg_speedup).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ap_by_id: BTreeMap<String, KnowledgeAntiPattern> =
        existing.anti_patterns.drain(..).map(|a| (a.id.clone(), a)).collect();
    for new in anti_patterns {
        match ap_by_id.remove(&new.id) {
            Some(old) => {
                let merged = merge_anti_pattern(old, new);
                ap_by_id.insert(merged.id.clone(), merged);
            },
            None => {
                ap_by_id.insert(new.id.clone(), new);
            },
        }
    }

    let mut source_runs = existing.source_runs;
    source_runs.push(run_name.to_string());
    source_runs.sort();
    source_runs.dedup();

    GlobalKnowledge {
        dataset: existing.dataset,
        last_updated: chrono::Utc::now().to_rfc3339(),
        source_runs,
        principles: merged_principles,
        anti_patterns: ap_by_id.into_values().collect(),
    }
}

fn merge_principle(old: KnowledgePrinciple, new: KnowledgePrinciple) -> KnowledgePrinciple {
    let mut speedups: Vec<f64> = old
        .verified_speedups
        .iter()
        .chain(new.verified_speedups.iter())
        .copied()
        .collect();
    speedups.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    speedups.dedup();

    let mut queries: Vec<String> =
        old.queries.iter().chain(new.queries.iter()).cloned().collect();
    queries.sort();
    queries.dedup();

    let mut transforms: Vec<String> =
        old.transforms.iter().chain(new.transforms.iter()).cloned().collect();
    transforms.sort();
    transforms.dedup();

    let avg = if speedups.is_empty() {
        0.0
    } else {
        speedups.iter().sum::<f64>() / speedups.len() as f64
    };

    KnowledgePrinciple {
        id: new.id,
        name: new.name,
        what: longer(old.what, new.what),
        why: longer(old.why, new.why),
        when: prefer_non_empty(new.when, old.when),
        when_not: prefer_non_empty(new.when_not, old.when_not),
        verified_speedups: speedups,
        avg_speedup: (avg * 1000.0).round() / 1000.0,
        queries,
        transforms,
    }
}

fn merge_anti_pattern(old: KnowledgeAntiPattern, new: KnowledgeAntiPattern) -> KnowledgeAntiPattern {
    let mut regressions: Vec<f64> = old
        .observed_regressions
        .iter()
        .chain(new.observed_regressions.iter())
        .copied()
        .collect();
    regressions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    regressions.dedup();

    let mut queries: Vec<String> =
        old.queries.iter().chain(new.queries.iter()).cloned().collect();
    queries.sort();
    queries.dedup();

    KnowledgeAntiPattern {
        id: new.id,
        name: new.name,
        mechanism: longer(old.mechanism, new.mechanism),
        observed_regressions: regressions,
        queries,
        avoid_when: prefer_non_empty(new.avoid_when, old.avoid_when),
    }
}

fn longer(a: String, b: String) -> String {
    if b.len() >= a.len() { b } else { a }
}

fn prefer_non_empty(preferred: String, fallback: String) -> String {
    if preferred.is_empty() { fallback } else { preferred }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principle(id: &str, speedups: &[f64], queries: &[&str], what: &str) -> KnowledgePrinciple {
        KnowledgePrinciple {
            id: id.to_string(),
            name: id.to_string(),
            what: what.to_string(),
            why: String::new(),
            when: String::new(),
            when_not: String::new(),
            verified_speedups: speedups.to_vec(),
            avg_speedup: speedups.iter().sum::<f64>() / speedups.len().max(1) as f64,
            queries: queries.iter().map(|q| q.to_string()).collect(),
            transforms: vec![id.to_string()],
        }
    }

    #[test]
    fn test_merge_is_monotone() {
        let existing = GlobalKnowledge {
            dataset: "duckdb_tpcds".to_string(),
            last_updated: String::new(),
            source_runs: vec!["run_a".to_string()],
            principles: vec![principle("or_to_union", &[2.98], &["q15"], "short")],
            anti_patterns: vec![],
        };

        let merged = merge_knowledge(
            existing,
            vec![principle("or_to_union", &[2.5], &["q2"], "a much longer description")],
            vec![],
            "run_b",
        );

        let p = &merged.principles[0];
        // Supersets of both inputs
        assert!(p.verified_speedups.contains(&2.98));
        assert!(p.verified_speedups.contains(&2.5));
        assert_eq!(p.queries, vec!["q15", "q2"]);
        // Longer text wins
        assert_eq!(p.what, "a much longer description");
        // avg is the mean of the merged list
        assert!((p.avg_speedup - 2.74).abs() < 1e-9);
        assert_eq!(merged.source_runs, vec!["run_a", "run_b"]);
    }

    #[test]
    fn test_new_principle_appended() {
        let existing = GlobalKnowledge::new("duckdb_tpcds");
        let merged = merge_knowledge(
            existing,
            vec![principle("push_pred", &[2.71], &["q93"], "x")],
            vec![],
            "run_1",
        );
        assert_eq!(merged.principles.len(), 1);
        assert_eq!(merged.source_runs, vec!["run_1"]);
    }

    #[test]
    fn test_principles_sorted_by_avg_after_merge() {
        let existing = GlobalKnowledge::new("d");
        let merged = merge_knowledge(
            existing,
            vec![
                principle("slow", &[1.2], &["q1"], "x"),
                principle("fast", &[3.0], &["q2"], "x"),
            ],
            vec![],
            "run_1",
        );
        assert_eq!(merged.principles[0].id, "fast");
    }

    #[test]
    fn test_anti_pattern_union() {
        let existing = GlobalKnowledge {
            dataset: "d".to_string(),
            last_updated: String::new(),
            source_runs: vec![],
            principles: vec![],
            anti_patterns: vec![KnowledgeAntiPattern {
                id: "regression_inline_cte".to_string(),
                name: "Regression: Inline Cte".to_string(),
                mechanism: "m".to_string(),
                observed_regressions: vec![0.6],
                queries: vec!["q7".to_string()],
                avoid_when: String::new(),
            }],
        };
        let merged = merge_knowledge(
            existing,
            vec![],
            vec![KnowledgeAntiPattern {
                id: "regression_inline_cte".to_string(),
                name: "Regression: Inline Cte".to_string(),
                mechanism: "a longer mechanism text".to_string(),
                observed_regressions: vec![0.8],
                queries: vec!["q9".to_string()],
                avoid_when: "avoid".to_string(),
            }],
            "run_2",
        );
        let ap = &merged.anti_patterns[0];
        assert_eq!(ap.observed_regressions, vec![0.6, 0.8]);
        assert_eq!(ap.queries, vec!["q7", "q9"]);
        assert_eq!(ap.mechanism, "a longer mechanism text");
        assert_eq!(ap.avoid_when, "avoid");
    }
}
