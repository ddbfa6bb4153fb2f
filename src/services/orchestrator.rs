//! Orchestrator - drives a query corpus through the pipeline
//!
//! Loads the cohort, runs the scheduler (wave mode) or per-query tree
//! search (mcts mode), then hands every attempt to the blackboard and emits
//! the leaderboard and summary. Knowledge files and the example directory
//! are only touched here, after all search has finished.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;

use crate::config::Config;
use crate::models::{
    AttemptStatus, Leaderboard, LeaderboardEntry, Provenance, QueryResult, WorkerAttempt,
};
use crate::services::blackboard::Blackboard;
use crate::services::llm::Completer;
use crate::services::mcts::{PriorConfig, SearchOptions, SearchTree};
use crate::services::plan_analyzer::analyze_plan;
use crate::services::registry::TransformRegistry;
use crate::services::runner::QueryRunner;
use crate::services::tag_index::TagIndex;
use crate::services::validator::{SqlValidator, ValidatorConfig, classify_status};
use crate::services::wave::checkpoint::{
    discover_results, load_checkpoint, write_checkpoint, write_progress,
};
use crate::services::wave::{CohortQuery, WaveConfig, WaveScheduler};
use crate::utils::write_json_atomic;

/// Flat per-call cost estimate for the summary; providers that report
/// usage refine this in their own logs.
const EST_COST_PER_CALL_USD: f64 = 0.002;

pub struct Orchestrator<'a> {
    config: &'a Config,
    registry: &'a TransformRegistry,
    completer: &'a dyn Completer,
    runner: Option<&'a dyn QueryRunner>,
    bench_dir: PathBuf,
    examples_root: PathBuf,
    models_dir: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a TransformRegistry,
        completer: &'a dyn Completer,
        runner: Option<&'a dyn QueryRunner>,
        bench_dir: impl Into<PathBuf>,
        examples_root: impl Into<PathBuf>,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            registry,
            completer,
            runner,
            bench_dir: bench_dir.into(),
            examples_root: examples_root.into(),
            models_dir: models_dir.into(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation flag; set by the binary's signal handler. In-flight
    /// work aborts at its next boundary and checkpoints are flushed.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn engine_examples_dir(&self) -> PathBuf {
        self.examples_root.join(&self.config.engine.kind)
    }

    fn dataset(&self) -> String {
        let benchmark = self
            .bench_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("benchmark");
        format!("{}_{}", self.config.engine.kind, benchmark)
    }

    /// Run the cohort and emit leaderboard + summary.
    pub async fn run(
        &self,
        query_filter: &[String],
        out_dir: Option<PathBuf>,
    ) -> anyhow::Result<Leaderboard> {
        let started = std::time::Instant::now();

        let cohort = self.load_cohort(query_filter)?;
        if cohort.is_empty() {
            anyhow::bail!("no queries found in {}", self.bench_dir.join("queries").display());
        }

        let mut index = TagIndex::new(&self.examples_root, &self.models_dir);
        index.load();
        let examples = crate::services::tag_index::load_all_examples(&self.examples_root);

        // Intelligence gate: refuse to run blind unless bootstrap is set
        if examples.is_empty() && !self.config.scheduler.bootstrap {
            anyhow::bail!(
                "no gold examples found under {}; run with --bootstrap for a first run",
                self.examples_root.display()
            );
        }
        if examples.is_empty() {
            tracing::warn!("Bootstrap mode: running without gold examples");
        }

        let out_dir = out_dir.unwrap_or_else(|| {
            let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
            self.bench_dir.join("runs").join(format!("run_{ts}"))
        });
        std::fs::create_dir_all(&out_dir)?;
        tracing::info!(
            "Running {} queries [{}] mode={} -> {}",
            cohort.len(),
            self.dataset(),
            self.config.scheduler.mode,
            out_dir.display()
        );

        let (results, attempts, api_calls) = if self.config.scheduler.mode == "mcts" {
            self.run_mcts(&cohort, &out_dir, &index, &examples).await?
        } else {
            let scheduler = WaveScheduler::new(
                self.registry,
                self.completer,
                if self.config.scheduler.api_only { None } else { self.runner },
                self.validator_config(),
                &index,
                examples.clone(),
                WaveConfig {
                    api_slots: self.config.completer.api_slots,
                    db_slots: self.config.engine.db_slots,
                    workers_per_query: self.config.scheduler.workers_per_query,
                    examples_per_prompt: self.config.search.examples_per_prompt,
                    api_only: self.config.scheduler.api_only,
                    resume: self.config.scheduler.resume,
                    completer_deadline: Duration::from_secs(self.config.completer.timeout_seconds),
                },
                &out_dir,
            )
            .with_cancel(Arc::clone(&self.cancel));
            let outcome = scheduler.run(&cohort).await?;
            (outcome.results, outcome.attempts, outcome.api_calls)
        };

        // Knowledge collation runs strictly after all search, serialized
        if !self.config.scheduler.api_only {
            let knowledge_path = self
                .bench_dir
                .join("knowledge")
                .join(format!("{}.json", self.dataset()));
            let blackboard = Blackboard::new(
                self.registry,
                &out_dir,
                knowledge_path,
                self.engine_examples_dir(),
                self.dataset(),
                self.config.promotion.min_speedup,
            );
            let report = blackboard.run(&attempts, &mut index)?;
            tracing::info!(
                "Blackboard: {} entries, {} principles, {} promoted",
                report.entries,
                report.principles,
                report.promoted.len()
            );
        }

        // Structured per-query contracts for downstream consumers
        if self.config.scheduler.output_contract {
            let contracts_dir = out_dir.join("contracts");
            for result in &results {
                write_json_atomic(
                    &contracts_dir.join(format!("{}.json", result.query_id)),
                    &serde_json::json!({
                        "query_id": result.query_id,
                        "status": result.status.as_str(),
                        "speedup": result.speedup,
                        "optimized_sql": result.optimized_sql,
                        "transforms": result.provenance.transforms_applied,
                        "run_name": result.provenance.run_name,
                    }),
                )?;
            }
            tracing::info!("Output contracts: {} written", results.len());
        }

        let leaderboard = self.build_leaderboard(&results);
        write_json_atomic(&self.bench_dir.join("leaderboard.json"), &leaderboard)?;

        let elapsed = started.elapsed().as_secs_f64();
        write_json_atomic(
            &out_dir.join("summary.json"),
            &serde_json::json!({
                "benchmark": self.bench_dir.file_name().and_then(|n| n.to_str()),
                "mode": self.config.scheduler.mode,
                "api_slots": self.config.completer.api_slots,
                "db_slots": self.config.engine.db_slots,
                "total": cohort.len(),
                "completed": results.len(),
                "elapsed_seconds": (elapsed * 10.0).round() / 10.0,
                "api_calls": api_calls,
                "estimated_cost_usd": api_calls as f64 * EST_COST_PER_CALL_USD,
                "status_counts": leaderboard.status_counts.clone(),
            }),
        )?;

        tracing::info!(
            "Cohort complete: {}/{} queries in {:.1}s",
            results.len(),
            cohort.len(),
            elapsed
        );
        Ok(leaderboard)
    }

    fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            rounds: self.config.engine.timing_rounds,
            statement_timeout: Duration::from_millis(self.config.engine.statement_timeout_ms),
            boost_variants: self.config.engine.boost_variants.clone(),
        }
    }

    /// Load queries/*.sql, sorted by file name, optionally prefix-filtered
    fn load_cohort(&self, filter: &[String]) -> anyhow::Result<Vec<CohortQuery>> {
        let queries_dir = self.bench_dir.join("queries");
        let mut cohort = Vec::new();

        let entries = std::fs::read_dir(&queries_dir)
            .with_context(|| format!("cannot read {}", queries_dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if !filter.is_empty() && !filter.iter().any(|f| id.starts_with(f.as_str())) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            cohort.push(CohortQuery { id, sql: sql.trim().to_string() });
        }
        cohort.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cohort)
    }

    /// MCTS mode: tree search per query, sequential over the cohort so DB
    /// timings stay clean; completer calls fan out inside each search.
    async fn run_mcts(
        &self,
        cohort: &[CohortQuery],
        out_dir: &Path,
        index: &TagIndex,
        examples: &[crate::models::GoldExample],
    ) -> anyhow::Result<(Vec<QueryResult>, Vec<WorkerAttempt>, u64)> {
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("mcts mode requires an engine connection"))?;
        let checkpoint_path = out_dir.join("checkpoint.json");

        let allowed: std::collections::BTreeSet<String> =
            cohort.iter().map(|q| q.id.clone()).collect();
        let mut completed = std::collections::BTreeSet::new();
        let mut results: Vec<QueryResult> = Vec::new();
        if self.config.scheduler.resume {
            completed = load_checkpoint(&checkpoint_path);
            completed.retain(|qid| allowed.contains(qid));
            for result in discover_results(out_dir, &allowed) {
                completed.insert(result.query_id.clone());
                results.push(result);
            }
            write_checkpoint(&checkpoint_path, &completed)?;
        }

        let mut attempts: Vec<WorkerAttempt> = Vec::new();
        let mut api_calls = 0u64;
        let validator_config = self.validator_config();

        for query in cohort {
            if completed.contains(&query.id) {
                continue;
            }
            if self.cancel.load(Ordering::Relaxed) {
                tracing::warn!("Cancelled; checkpoint covers {} queries", completed.len());
                break;
            }

            let plan = match runner.explain_analyze(&query.sql).await {
                Ok(tree) => Some(analyze_plan(&tree, &query.sql)),
                Err(e) if e.is_infrastructure() => {
                    tracing::error!("{}: engine unreachable: {}", query.id, e);
                    let result = QueryResult::errored(&query.id, e.to_string());
                    write_json_atomic(&out_dir.join(&query.id).join("result.json"), &result)?;
                    results.push(result);
                    completed.insert(query.id.clone());
                    write_checkpoint(&checkpoint_path, &completed)?;
                    continue;
                },
                Err(e) => {
                    tracing::warn!("{}: EXPLAIN ANALYZE failed: {}", query.id, e);
                    None
                },
            };

            let validator = SqlValidator::new(runner, validator_config.clone());
            let query_examples: Vec<crate::models::GoldExample> = index
                .rank_examples(&query.sql, examples)
                .into_iter()
                .take(self.config.search.examples_per_prompt)
                .collect();

            let mut tree = SearchTree::new(
                &query.sql,
                self.registry,
                self.completer,
                &validator,
                query_examples,
                plan,
                SearchOptions::from_config(
                    &self.config.search,
                    Duration::from_secs(self.config.completer.timeout_seconds),
                ),
                PriorConfig {
                    use_puct: self.config.search.use_puct,
                    use_opportunity_detection: self.config.search.use_opportunity_detection,
                    use_llm_ranking: self.config.search.use_llm_ranking,
                    llm_timeout: Duration::from_millis(self.config.search.llm_timeout_ms),
                    ..PriorConfig::default()
                },
            );
            let outcome = tree.run().await;
            api_calls += outcome.attempts.len() as u64;

            let result = match &outcome.best_validation {
                Some(validation) => QueryResult {
                    query_id: query.id.clone(),
                    status: classify_status(validation),
                    speedup: Some(validation.speedup),
                    original_ms: Some(validation.original_ms),
                    optimized_ms: Some(validation.optimized_ms),
                    original_sql: query.sql.clone(),
                    optimized_sql: outcome.best_sql.clone(),
                    provenance: Provenance {
                        run_name: out_dir
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("run")
                            .to_string(),
                        transforms_applied: outcome.transforms_applied.clone(),
                        reasoning: outcome.explanation.clone(),
                        worker_id: None,
                    },
                    error: None,
                },
                None => QueryResult {
                    query_id: query.id.clone(),
                    status: AttemptStatus::Neutral,
                    speedup: None,
                    original_ms: None,
                    optimized_ms: None,
                    original_sql: query.sql.clone(),
                    optimized_sql: query.sql.clone(),
                    provenance: Provenance::default(),
                    error: None,
                },
            };

            attempts.push(WorkerAttempt {
                query_id: query.id.clone(),
                worker_id: 1,
                strategy: "mcts".to_string(),
                examples_used: Vec::new(),
                assigned_transforms: outcome.transforms_applied.clone(),
                response_text: outcome.explanation.clone(),
                original_sql: query.sql.clone(),
                optimized_sql: outcome.best_sql.clone(),
                validation: outcome.best_validation.clone(),
                error: None,
            });

            let query_dir = out_dir.join(&query.id);
            write_json_atomic(&query_dir.join("search_log.json"), &outcome.attempts)?;
            write_json_atomic(&query_dir.join("result.json"), &result)?;
            tracing::info!(
                "{}: {} after {} iterations ({} nodes)",
                query.id,
                result.status.as_str(),
                outcome.iterations,
                outcome.tree_size
            );

            results.push(result);
            completed.insert(query.id.clone());
            write_checkpoint(&checkpoint_path, &completed)?;
            write_progress(out_dir, cohort.len(), &results, api_calls)?;
        }

        Ok((results, attempts, api_calls))
    }

    fn build_leaderboard(&self, results: &[QueryResult]) -> Leaderboard {
        let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
        for status in [
            AttemptStatus::Win,
            AttemptStatus::Improved,
            AttemptStatus::Neutral,
            AttemptStatus::Regression,
            AttemptStatus::Error,
            AttemptStatus::Fail,
            AttemptStatus::Unvalidated,
        ] {
            status_counts.insert(status.as_str().to_string(), 0);
        }

        let mut entries = Vec::new();
        for result in results {
            *status_counts.entry(result.status.as_str().to_string()).or_insert(0) += 1;
            entries.push(LeaderboardEntry {
                query_id: result.query_id.clone(),
                status: result.status,
                speedup: result.speedup,
                original_ms: result.original_ms,
                optimized_ms: result.optimized_ms,
                transforms: result.provenance.transforms_applied.clone(),
            });
        }
        entries.sort_by(|a, b| {
            b.speedup
                .unwrap_or(0.0)
                .partial_cmp(&a.speedup.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Leaderboard {
            benchmark: self
                .bench_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("benchmark")
                .to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            status_counts,
            entries,
        }
    }
}
