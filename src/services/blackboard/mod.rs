//! Blackboard - deterministic knowledge collation
//!
//! Every worker attempt leaves a knowledge entry; after the cohort
//! finishes, entries are collated into principles and anti-patterns, merged
//! into the durable per-dataset knowledge file, winners are promoted to
//! gold examples, and the tag index is rebuilt. Phases 3-5 are the only
//! writers of shared knowledge state and run serialized, after all search.

pub mod collate;
pub mod extract;
pub mod merge;
pub mod promote;
pub mod sql_diff;

use std::path::PathBuf;

use serde_json::json;

use crate::models::{BlackboardEntry, GlobalKnowledge, WorkerAttempt};
use crate::services::registry::TransformRegistry;
use crate::services::tag_index::TagIndex;
use crate::utils::{load_json, write_json_atomic};

pub use promote::PromotionRecord;

/// Summary of one blackboard run over a cohort
#[derive(Debug)]
pub struct BlackboardReport {
    pub entries: usize,
    pub principles: usize,
    pub anti_patterns: usize,
    pub promoted: Vec<PromotionRecord>,
    pub indexed_examples: usize,
}

pub struct Blackboard<'a> {
    registry: &'a TransformRegistry,
    /// benchmarks/<name>/runs/run_<ts>/
    run_dir: PathBuf,
    /// benchmarks/<name>/knowledge/<dataset>.json
    knowledge_path: PathBuf,
    /// examples/<engine>/
    examples_dir: PathBuf,
    dataset: String,
    run_name: String,
    min_promote_speedup: f64,
}

impl<'a> Blackboard<'a> {
    pub fn new(
        registry: &'a TransformRegistry,
        run_dir: impl Into<PathBuf>,
        knowledge_path: impl Into<PathBuf>,
        examples_dir: impl Into<PathBuf>,
        dataset: impl Into<String>,
        min_promote_speedup: f64,
    ) -> Self {
        let run_dir = run_dir.into();
        let run_name = run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("run")
            .to_string();
        Self {
            registry,
            run_dir,
            knowledge_path: knowledge_path.into(),
            examples_dir: examples_dir.into(),
            dataset: dataset.into(),
            run_name,
            min_promote_speedup,
        }
    }

    /// Run phases 1-5 over the cohort's worker attempts.
    pub fn run(
        &self,
        attempts: &[WorkerAttempt],
        index: &mut TagIndex,
    ) -> std::io::Result<BlackboardReport> {
        // Phase 1: extract one entry per worker attempt
        let entries: Vec<BlackboardEntry> = attempts
            .iter()
            .map(|a| extract::build_entry(a, &self.run_name, self.registry))
            .collect();
        for entry in &entries {
            let path = self
                .run_dir
                .join("blackboard")
                .join("raw")
                .join(&entry.query_id)
                .join(format!("worker_{}.json", entry.worker_id));
            write_json_atomic(&path, entry)?;
        }
        tracing::info!("Phase 1 complete: {} blackboard entries", entries.len());

        // Phase 2: collate into principles and anti-patterns
        let (principles, anti_patterns) = collate::collate(&entries, self.registry);
        write_json_atomic(
            &self.run_dir.join("blackboard").join("collated.json"),
            &json!({
                "principles": principles,
                "anti_patterns": anti_patterns,
                "summary": {
                    "n_principles": principles.len(),
                    "n_anti_patterns": anti_patterns.len(),
                },
            }),
        )?;
        tracing::info!(
            "Phase 2 complete: {} principles, {} anti-patterns",
            principles.len(),
            anti_patterns.len()
        );

        // Phase 3: merge into the durable knowledge file
        let existing: GlobalKnowledge = load_json(&self.knowledge_path)
            .unwrap_or_else(|| GlobalKnowledge::new(&self.dataset));
        let merged = merge::merge_knowledge(
            existing,
            principles.clone(),
            anti_patterns.clone(),
            &self.run_name,
        );
        write_json_atomic(&self.knowledge_path, &merged)?;
        tracing::info!(
            "Phase 3 complete: {} principles total across {} runs",
            merged.principles.len(),
            merged.source_runs.len()
        );

        // Phase 4: promote winners to gold examples
        let promoted = promote::promote_winners(
            attempts,
            &self.examples_dir,
            self.registry,
            self.min_promote_speedup,
        )?;
        tracing::info!("Phase 4 complete: {} examples promoted", promoted.len());

        // Phase 5: rebuild the tag index
        let indexed = index
            .rebuild()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        tracing::info!("Phase 5 complete: tag index covers {} examples", indexed);

        Ok(BlackboardReport {
            entries: entries.len(),
            principles: principles.len(),
            anti_patterns: anti_patterns.len(),
            promoted,
            indexed_examples: indexed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ValidationResult, ValidationStatus};

    fn attempt(query: &str, transform: &str, speedup: f64, rows_match: bool) -> WorkerAttempt {
        WorkerAttempt {
            query_id: query.to_string(),
            worker_id: 1,
            strategy: String::new(),
            examples_used: vec![],
            assigned_transforms: vec![transform.to_string()],
            response_text: String::new(),
            original_sql: "SELECT * FROM t WHERE a = 1 OR b = 2".to_string(),
            optimized_sql: "SELECT * FROM t WHERE a = 1".to_string(),
            validation: Some(ValidationResult {
                status: if rows_match { ValidationStatus::Pass } else { ValidationStatus::FailRows },
                rows_match,
                checksum_match: rows_match,
                original_ms: 100.0,
                optimized_ms: 100.0 / speedup.max(0.01),
                speedup: if rows_match { speedup } else { 0.0 },
                original_rows: 5,
                optimized_rows: 5,
                error: None,
                config_variant: None,
            }),
            error: None,
        }
    }

    #[test]
    fn test_full_pipeline_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("runs").join("run_1");
        let knowledge = dir.path().join("knowledge").join("duckdb_tpcds.json");
        let examples = dir.path().join("examples").join("duckdb");
        let registry = TransformRegistry::with_builtins();

        let blackboard =
            Blackboard::new(&registry, &run_dir, &knowledge, &examples, "duckdb_tpcds", 2.0);
        let mut index = TagIndex::new(dir.path().join("examples"), dir.path().join("models"));

        let attempts = vec![
            attempt("q15", "or_to_union", 2.98, true),
            attempt("q2", "push_pred", 1.05, true),
            attempt("q7", "flatten_subq", 0.0, false),
        ];
        let report = blackboard.run(&attempts, &mut index).unwrap();

        assert_eq!(report.entries, 3);
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(report.indexed_examples, 1);

        assert!(run_dir.join("blackboard/raw/q15/worker_1.json").exists());
        assert!(run_dir.join("blackboard/collated.json").exists());
        assert!(knowledge.exists());
        assert!(examples.join("or_to_union.json").exists());

        let gk: GlobalKnowledge = load_json(&knowledge).unwrap();
        assert_eq!(gk.source_runs, vec!["run_1"]);
        assert!(gk.principles.iter().any(|p| p.id == "or_to_union"));
        assert!(gk.anti_patterns.iter().any(|a| a.id == "semantic_mismatch_flatten_subq"));
    }

    #[test]
    fn test_second_run_merges_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = dir.path().join("knowledge").join("d.json");
        let examples = dir.path().join("examples").join("duckdb");
        let registry = TransformRegistry::with_builtins();
        let mut index = TagIndex::new(dir.path().join("examples"), dir.path().join("models"));

        let run1 = Blackboard::new(
            &registry,
            dir.path().join("runs/run_1"),
            &knowledge,
            &examples,
            "d",
            2.0,
        );
        run1.run(&[attempt("q15", "or_to_union", 2.98, true)], &mut index).unwrap();

        let run2 = Blackboard::new(
            &registry,
            dir.path().join("runs/run_2"),
            &knowledge,
            &examples,
            "d",
            2.0,
        );
        run2.run(&[attempt("q3", "or_to_union", 2.2, true)], &mut index).unwrap();

        let gk: GlobalKnowledge = load_json(&knowledge).unwrap();
        assert_eq!(gk.source_runs, vec!["run_1", "run_2"]);
        let p = gk.principles.iter().find(|p| p.id == "or_to_union").unwrap();
        assert_eq!(p.queries, vec!["q15", "q3"]);
        assert_eq!(p.verified_speedups.len(), 2);
    }
}
