//! Wave scheduler - cohort pipeline over two slot pools
//!
//! Queries move through alternating API waves (concurrent completer calls)
//! and DB waves (concurrent engine executions):
//!
//! 1. Wave 1 (API): per-worker rewrite proposals for every pending query
//! 2. Wave 2 (DB): plan capture + interleaved validation of each proposal
//! 3. Wave 3 (API): snipe proposals for queries still without a WIN,
//!    conditioned on Wave-2 outcomes
//! 4. Wave 4 (DB): validation of the snipe candidates
//!
//! Between waves the scheduler flushes an atomic checkpoint and progress
//! snapshot, so a crash resumes with no duplicate work. In api-only mode
//! the DB waves are no-ops and every result is marked UNVALIDATED.

pub mod checkpoint;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::models::{AttemptStatus, GoldExample, Provenance, QueryResult, WorkerAttempt};
use crate::services::blackboard::extract::extract_transforms;
use crate::services::llm::Completer;
use crate::services::plan_analyzer::{OptimizationContext, analyze_plan};
use crate::services::registry::TransformRegistry;
use crate::services::rewriter::assemble_response;
use crate::services::rewriter::response::extract_sql;
use crate::services::runner::QueryRunner;
use crate::services::sql_dag::SqlDag;
use crate::services::tag_index::{ExampleSelector, TagIndex};
use crate::services::validator::{SqlValidator, ValidatorConfig, classify_status};
use crate::utils::write_json_atomic;

use checkpoint::{discover_results, load_checkpoint, write_checkpoint, write_progress};

/// One query of the cohort
#[derive(Debug, Clone)]
pub struct CohortQuery {
    pub id: String,
    pub sql: String,
}

#[derive(Debug, Clone)]
pub struct WaveConfig {
    pub api_slots: usize,
    pub db_slots: usize,
    pub workers_per_query: usize,
    pub examples_per_prompt: usize,
    pub api_only: bool,
    pub resume: bool,
    pub completer_deadline: Duration,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            api_slots: 32,
            db_slots: 8,
            workers_per_query: 2,
            examples_per_prompt: 3,
            api_only: false,
            resume: false,
            completer_deadline: Duration::from_secs(120),
        }
    }
}

/// Results plus the raw attempts for the blackboard
#[derive(Debug, Default)]
pub struct WaveRunOutcome {
    pub results: Vec<QueryResult>,
    pub attempts: Vec<WorkerAttempt>,
    pub api_calls: u64,
}

/// Worker strategy rotations for Wave-1 proposals
const WORKER_STRATEGIES: [(&str, &str); 4] = [
    (
        "conservative_predicate_pushdown",
        "Prefer minimal, surgical changes: push filters closer to base tables and remove \
         redundant work. Keep the query shape intact.",
    ),
    (
        "moderate_date_isolation",
        "Isolate selective dimension filters into small CTEs so fact-table scans shrink as \
         early as possible.",
    ),
    (
        "aggressive_cte_restructure",
        "Restructure freely: precompute shared aggregates in CTEs, reorganize joins around \
         them, and collapse repeated scans.",
    ),
    (
        "novel_structural_transform",
        "Consider structural rewrites: OR conditions to UNION ALL, correlated subqueries to \
         precomputed CTEs, multiple scans to conditional aggregation.",
    ),
];

pub struct WaveScheduler<'a> {
    registry: &'a TransformRegistry,
    completer: &'a dyn Completer,
    /// None in api-only mode
    runner: Option<&'a dyn QueryRunner>,
    validator_config: ValidatorConfig,
    index: &'a TagIndex,
    examples: Vec<GoldExample>,
    config: WaveConfig,
    out_dir: PathBuf,
    run_name: String,
    cancel: Arc<AtomicBool>,
    api_calls: AtomicU64,
}

impl<'a> WaveScheduler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: &'a TransformRegistry,
        completer: &'a dyn Completer,
        runner: Option<&'a dyn QueryRunner>,
        validator_config: ValidatorConfig,
        index: &'a TagIndex,
        examples: Vec<GoldExample>,
        config: WaveConfig,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        let out_dir = out_dir.into();
        let run_name = out_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("run")
            .to_string();
        Self {
            registry,
            completer,
            runner,
            validator_config,
            index,
            examples,
            config,
            out_dir,
            run_name,
            cancel: Arc::new(AtomicBool::new(false)),
            api_calls: AtomicU64::new(0),
        }
    }

    /// Flag for external cancellation (ctrl-c wiring lives in the binary).
    /// In-flight steps finish or abort at their next boundary, then the
    /// checkpoint is flushed before return.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Share a caller-owned cancellation flag
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run the cohort through waves 1-4.
    pub async fn run(&self, cohort: &[CohortQuery]) -> std::io::Result<WaveRunOutcome> {
        let allowed: BTreeSet<String> = cohort.iter().map(|q| q.id.clone()).collect();
        let checkpoint_path = self.out_dir.join("checkpoint.json");

        let mut results: Vec<QueryResult> = Vec::new();
        let mut completed: BTreeSet<String> = BTreeSet::new();

        if self.config.resume {
            // Union of checkpoint ids and complete result.json files
            completed = load_checkpoint(&checkpoint_path);
            completed.retain(|qid| allowed.contains(qid));
            let recovered = discover_results(&self.out_dir, &allowed);
            for result in recovered {
                completed.insert(result.query_id.clone());
                results.push(result);
            }
            // Heal the checkpoint from discovered artifacts
            write_checkpoint(&checkpoint_path, &completed)?;
            tracing::info!("Resuming: {} queries already complete", completed.len());
        }

        let pending: Vec<&CohortQuery> =
            cohort.iter().filter(|q| !completed.contains(&q.id)).collect();
        if pending.is_empty() {
            tracing::info!("All queries already complete");
            return Ok(WaveRunOutcome { results, attempts: Vec::new(), api_calls: 0 });
        }

        write_progress(&self.out_dir, cohort.len(), &results, 0)?;
        tracing::info!(
            "Wave pipeline: {} pending, api_slots={}, db_slots={}",
            pending.len(),
            self.config.api_slots,
            self.config.db_slots
        );

        // ── Wave 1 (API): per-worker proposals ─────────────────────────
        let mut attempts_by_query = self.wave_proposals(&pending).await;
        self.flush(&checkpoint_path, &completed, cohort.len(), &results)?;
        if self.cancelled() {
            return Ok(self.outcome(results, attempts_by_query));
        }

        // ── Wave 2 (DB): plan capture + candidate benchmarks ───────────
        let mut plans: HashMap<String, OptimizationContext> = HashMap::new();
        if !self.config.api_only {
            plans = self.wave_benchmark(&pending, &mut attempts_by_query).await;
        }
        self.flush(&checkpoint_path, &completed, cohort.len(), &results)?;
        if self.cancelled() {
            return Ok(self.outcome(results, attempts_by_query));
        }

        // Finalize queries that already have a WIN; the snipe is for the rest
        let mut needs_snipe: Vec<&CohortQuery> = Vec::new();
        for query in &pending {
            let attempts = attempts_by_query.get(&query.id).cloned().unwrap_or_default();
            let has_win = !self.config.api_only
                && attempts
                    .iter()
                    .filter_map(|a| a.validation.as_ref())
                    .any(|v| v.is_pass() && v.speedup >= 2.0);
            if has_win {
                let result = self.finalize_query(query, &attempts)?;
                results.push(result);
                completed.insert(query.id.clone());
            } else {
                needs_snipe.push(query);
            }
        }
        self.flush(&checkpoint_path, &completed, cohort.len(), &results)?;

        // ── Wave 3 (API): snipe proposals conditioned on Wave-2 ────────
        if !self.cancelled() {
            let snipes = self.wave_snipe(&needs_snipe, &attempts_by_query, &plans).await;
            for (qid, attempt) in snipes {
                attempts_by_query.entry(qid).or_default().push(attempt);
            }
        }
        self.flush(&checkpoint_path, &completed, cohort.len(), &results)?;

        // ── Wave 4 (DB): final candidate benchmarks ────────────────────
        if !self.config.api_only && !self.cancelled() {
            self.wave_benchmark_unvalidated(&mut attempts_by_query).await;
        }

        // Finalize everything still pending
        for query in &pending {
            if completed.contains(&query.id) {
                continue;
            }
            let attempts = attempts_by_query.get(&query.id).cloned().unwrap_or_default();
            let result = self.finalize_query(query, &attempts)?;
            results.push(result);
            completed.insert(query.id.clone());
        }

        self.flush(&checkpoint_path, &completed, cohort.len(), &results)?;
        Ok(self.outcome(results, attempts_by_query))
    }

    fn outcome(
        &self,
        results: Vec<QueryResult>,
        attempts_by_query: HashMap<String, Vec<WorkerAttempt>>,
    ) -> WaveRunOutcome {
        let mut attempts: Vec<WorkerAttempt> =
            attempts_by_query.into_values().flatten().collect();
        attempts.sort_by(|a, b| {
            a.query_id.cmp(&b.query_id).then(a.worker_id.cmp(&b.worker_id))
        });
        WaveRunOutcome {
            results,
            attempts,
            api_calls: self.api_calls.load(Ordering::Relaxed),
        }
    }

    fn flush(
        &self,
        checkpoint_path: &std::path::Path,
        completed: &BTreeSet<String>,
        total: usize,
        results: &[QueryResult],
    ) -> std::io::Result<()> {
        write_checkpoint(checkpoint_path, completed)?;
        write_progress(
            &self.out_dir,
            total,
            results,
            self.api_calls.load(Ordering::Relaxed),
        )
    }

    /// Wave 1: concurrent worker proposals, bounded by the API slot pool
    async fn wave_proposals(
        &self,
        pending: &[&CohortQuery],
    ) -> HashMap<String, Vec<WorkerAttempt>> {
        let proposals: Vec<(String, Vec<WorkerAttempt>)> = stream::iter(
            pending.iter().map(|query| self.propose_for_query(query)),
        )
        .buffer_unordered(self.config.api_slots.max(1))
        .collect()
        .await;

        proposals.into_iter().collect()
    }

    async fn propose_for_query(&self, query: &CohortQuery) -> (String, Vec<WorkerAttempt>) {
        let mut attempts = Vec::new();
        if self.cancelled() {
            return (query.id.clone(), attempts);
        }

        let dag = SqlDag::from_sql(&query.sql);
        let mut selector = ExampleSelector::new(
            &query.sql,
            self.index,
            &self.examples,
            self.config.examples_per_prompt,
        );

        // Analyst pass: one call whose notes steer every worker. Failures
        // just mean the workers fly without notes.
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        let analysis = match self
            .completer
            .complete(&build_analyst_prompt(&query.sql, &dag), self.config.completer_deadline)
            .await
        {
            Ok(text) => Some(format!(
                "## Analyst Notes\n{}",
                crate::utils::truncate_chars(text.trim(), 1500)
            )),
            Err(e) => {
                tracing::debug!("{}: analyst call failed: {}", query.id, e);
                None
            },
        };

        for worker_id in 1..=self.config.workers_per_query as u32 {
            if self.cancelled() {
                break;
            }
            let (strategy, emphasis) =
                WORKER_STRATEGIES[(worker_id as usize - 1) % WORKER_STRATEGIES.len()];
            let examples = selector.current().to_vec();
            let prompt = build_worker_prompt(
                &query.sql,
                &dag,
                &examples,
                emphasis,
                None,
                analysis.as_deref(),
            );

            self.api_calls.fetch_add(1, Ordering::Relaxed);
            let response = self
                .completer
                .complete(&prompt, self.config.completer_deadline)
                .await;

            let mut attempt = WorkerAttempt {
                query_id: query.id.clone(),
                worker_id,
                strategy: strategy.to_string(),
                examples_used: examples.iter().map(|e| e.id.clone()).collect(),
                assigned_transforms: Vec::new(),
                response_text: String::new(),
                original_sql: query.sql.clone(),
                optimized_sql: String::new(),
                validation: None,
                error: None,
            };

            match response {
                Ok(text) => {
                    attempt.response_text = text.clone();
                    match assemble_response(&query.sql, &dag, &text) {
                        Ok((sql, _)) => attempt.optimized_sql = sql,
                        Err(reason) => {
                            tracing::debug!(
                                "{} worker {}: unusable proposal ({})",
                                query.id,
                                worker_id,
                                reason
                            );
                            // Keep the raw SQL if any was extractable
                            if let Some(sql) = extract_sql(&text) {
                                attempt.optimized_sql = sql;
                            } else {
                                attempt.error = Some(format!("unusable proposal: {reason}"));
                            }
                        },
                    }
                },
                Err(e) => {
                    tracing::debug!("{} worker {}: completer error: {}", query.id, worker_id, e);
                    attempt.error = Some(e.to_string());
                },
            }

            attempts.push(attempt);
            // The next worker sees a fresh window of examples
            selector.rotate();
        }

        (query.id.clone(), attempts)
    }

    /// Wave 2: capture plans and validate all proposals, bounded by the DB
    /// slot pool. Validation within a query is strictly sequential.
    async fn wave_benchmark(
        &self,
        pending: &[&CohortQuery],
        attempts_by_query: &mut HashMap<String, Vec<WorkerAttempt>>,
    ) -> HashMap<String, OptimizationContext> {
        let Some(runner) = self.runner else { return HashMap::new() };

        let work: Vec<(String, String, Vec<WorkerAttempt>)> = pending
            .iter()
            .filter_map(|q| {
                attempts_by_query
                    .remove(&q.id)
                    .map(|attempts| (q.id.clone(), q.sql.clone(), attempts))
            })
            .collect();

        let benched: Vec<(String, Vec<WorkerAttempt>, Option<OptimizationContext>)> =
            stream::iter(work.into_iter().map(|(qid, sql, attempts)| async move {
                if self.cancelled() {
                    return (qid, attempts, None);
                }
                let plan = match runner.explain_analyze(&sql).await {
                    Ok(tree) => Some(analyze_plan(&tree, &sql)),
                    Err(e) => {
                        tracing::warn!("{}: EXPLAIN ANALYZE failed: {}", qid, e);
                        None
                    },
                };
                let attempts = self.validate_attempts(&sql, attempts).await;
                (qid, attempts, plan)
            }))
            .buffer_unordered(self.config.db_slots.max(1))
            .collect()
            .await;

        let mut plans = HashMap::new();
        for (qid, attempts, plan) in benched {
            if let Some(plan) = plan {
                plans.insert(qid.clone(), plan);
            }
            attempts_by_query.insert(qid, attempts);
        }
        plans
    }

    /// Wave 4: validate only the attempts that have not been benchmarked
    async fn wave_benchmark_unvalidated(
        &self,
        attempts_by_query: &mut HashMap<String, Vec<WorkerAttempt>>,
    ) {
        if self.runner.is_none() {
            return;
        }

        let work: Vec<(String, Vec<WorkerAttempt>)> = attempts_by_query.drain().collect();
        let benched: Vec<(String, Vec<WorkerAttempt>)> =
            stream::iter(work.into_iter().map(|(qid, attempts)| async move {
                if self.cancelled() {
                    return (qid, attempts);
                }
                let original =
                    attempts.first().map(|a| a.original_sql.clone()).unwrap_or_default();
                let attempts = self.validate_attempts(&original, attempts).await;
                (qid, attempts)
            }))
            .buffer_unordered(self.config.db_slots.max(1))
            .collect()
            .await;

        attempts_by_query.extend(benched);
    }

    async fn validate_attempts(
        &self,
        original: &str,
        mut attempts: Vec<WorkerAttempt>,
    ) -> Vec<WorkerAttempt> {
        let Some(runner) = self.runner else { return attempts };
        let validator = SqlValidator::new(runner, self.validator_config.clone());

        for attempt in &mut attempts {
            if attempt.validation.is_some()
                || attempt.error.is_some()
                || attempt.optimized_sql.is_empty()
            {
                continue;
            }
            if self.cancelled() {
                break;
            }
            let result = validator.validate(original, &attempt.optimized_sql).await;
            tracing::debug!(
                "{} worker {}: {} ({:.2}x)",
                attempt.query_id,
                attempt.worker_id,
                result.status.as_str(),
                result.speedup
            );
            attempt.validation = Some(result);
        }
        attempts
    }

    /// Wave 3: one reanalysis proposal per query, fed with Wave-2 outcomes
    async fn wave_snipe(
        &self,
        queries: &[&CohortQuery],
        attempts_by_query: &HashMap<String, Vec<WorkerAttempt>>,
        plans: &HashMap<String, OptimizationContext>,
    ) -> Vec<(String, WorkerAttempt)> {
        let snipe_worker_id = self.config.workers_per_query as u32 + 1;

        stream::iter(queries.iter().map(|query| {
            let prior_attempts = attempts_by_query.get(&query.id);
            let plan = plans.get(&query.id);
            async move {
                if self.cancelled() {
                    return None;
                }
                let dag = SqlDag::from_sql(&query.sql);
                let mut selector = ExampleSelector::new(
                    &query.sql,
                    self.index,
                    &self.examples,
                    self.config.examples_per_prompt,
                );
                // Skip past the windows the Wave-1 workers already saw
                for _ in 0..self.config.workers_per_query {
                    selector.rotate();
                }

                let feedback = prior_attempts.map(|attempts| summarize_attempts(attempts));
                let prompt = build_worker_prompt(
                    &query.sql,
                    &dag,
                    selector.current(),
                    "Reanalyze with the benchmark feedback below. Keep what worked, abandon \
                     what failed, and target the slowest part of the plan.",
                    plan,
                    feedback.as_deref(),
                );

                self.api_calls.fetch_add(1, Ordering::Relaxed);
                let mut attempt = WorkerAttempt {
                    query_id: query.id.clone(),
                    worker_id: snipe_worker_id,
                    strategy: "snipe_reanalysis".to_string(),
                    examples_used: selector.current().iter().map(|e| e.id.clone()).collect(),
                    assigned_transforms: Vec::new(),
                    response_text: String::new(),
                    original_sql: query.sql.clone(),
                    optimized_sql: String::new(),
                    validation: None,
                    error: None,
                };

                match self.completer.complete(&prompt, self.config.completer_deadline).await {
                    Ok(text) => {
                        attempt.response_text = text.clone();
                        match assemble_response(&query.sql, &dag, &text) {
                            Ok((sql, _)) => attempt.optimized_sql = sql,
                            Err(reason) => {
                                attempt.error = Some(format!("unusable proposal: {reason}"));
                            },
                        }
                    },
                    Err(e) => attempt.error = Some(e.to_string()),
                }

                Some((query.id.clone(), attempt))
            }
        }))
        .buffer_unordered(self.config.api_slots.max(1))
        .collect::<Vec<Option<(String, WorkerAttempt)>>>()
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// Pick the best attempt, classify it, and persist the query's
    /// artifacts (result.json + workers.json).
    fn finalize_query(
        &self,
        query: &CohortQuery,
        attempts: &[WorkerAttempt],
    ) -> std::io::Result<QueryResult> {
        let best_validated = attempts
            .iter()
            .filter(|a| a.validation.as_ref().map(|v| v.is_pass()).unwrap_or(false))
            .max_by(|a, b| {
                let sa = a.validation.as_ref().map(|v| v.speedup).unwrap_or(0.0);
                let sb = b.validation.as_ref().map(|v| v.speedup).unwrap_or(0.0);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            });

        let result = if let Some(best) = best_validated {
            let validation = best.validation.as_ref().expect("filtered validated");
            QueryResult {
                query_id: query.id.clone(),
                status: classify_status(validation),
                speedup: Some(validation.speedup),
                original_ms: Some(validation.original_ms),
                optimized_ms: Some(validation.optimized_ms),
                original_sql: query.sql.clone(),
                optimized_sql: best.optimized_sql.clone(),
                provenance: self.provenance_for(best),
                error: None,
            }
        } else if self.config.api_only {
            // api-only: a proposal artifact without timing
            let proposal = attempts.iter().find(|a| !a.optimized_sql.is_empty());
            QueryResult {
                query_id: query.id.clone(),
                status: AttemptStatus::Unvalidated,
                speedup: None,
                original_ms: None,
                optimized_ms: None,
                original_sql: query.sql.clone(),
                optimized_sql: proposal.map(|a| a.optimized_sql.clone()).unwrap_or_default(),
                provenance: proposal.map(|a| self.provenance_for(a)).unwrap_or_default(),
                error: None,
            }
        } else {
            // Every attempt failed: report the most informative failure
            let failed = attempts.iter().find_map(|a| {
                a.error
                    .clone()
                    .or_else(|| a.validation.as_ref().and_then(|v| v.error.clone()))
            });
            let worst_status = attempts
                .iter()
                .filter_map(|a| a.validation.as_ref())
                .map(classify_status)
                .next()
                .unwrap_or(AttemptStatus::Error);
            QueryResult {
                query_id: query.id.clone(),
                status: worst_status,
                speedup: None,
                original_ms: None,
                optimized_ms: None,
                original_sql: query.sql.clone(),
                optimized_sql: String::new(),
                provenance: Provenance { run_name: self.run_name.clone(), ..Default::default() },
                error: failed,
            }
        };

        let query_dir = self.out_dir.join(&query.id);
        write_json_atomic(&query_dir.join("workers.json"), &attempts)?;
        write_json_atomic(&query_dir.join("result.json"), &result)?;
        tracing::info!(
            "{}: {} ({})",
            query.id,
            result.status.as_str(),
            result
                .speedup
                .map(|s| format!("{s:.2}x"))
                .unwrap_or_else(|| "no timing".to_string())
        );
        Ok(result)
    }

    fn provenance_for(&self, attempt: &WorkerAttempt) -> Provenance {
        Provenance {
            run_name: self.run_name.clone(),
            transforms_applied: extract_transforms(attempt, self.registry),
            reasoning: crate::services::blackboard::extract::extract_changes_section(
                &attempt.response_text,
            )
            .unwrap_or_default(),
            worker_id: Some(attempt.worker_id),
        }
    }
}

/// Analyst prompt: a cheap reconnaissance pass over the query structure
fn build_analyst_prompt(sql: &str, dag: &SqlDag) -> String {
    let mut sections = vec![
        "Analyze this SQL query for optimization potential. Do NOT rewrite it."
            .to_string(),
    ];
    if !dag.is_empty() {
        sections.push(dag.to_prompt(false));
    }
    sections.push(format!("## SQL\n```sql\n{}\n```", sql.trim()));
    sections.push(
        "Answer briefly: (1) where do rows and cost concentrate, (2) which rewrite \
         patterns plausibly apply (filter pushdown, date CTE isolation, OR to UNION \
         ALL, decorrelation, scan consolidation), (3) what must NOT change for \
         semantic equivalence."
            .to_string(),
    );
    sections.join("\n\n---\n\n")
}

/// Summarize benchmark outcomes for the snipe prompt
fn summarize_attempts(attempts: &[WorkerAttempt]) -> String {
    let mut lines = vec!["## Benchmark Feedback".to_string()];
    for attempt in attempts {
        let line = match (&attempt.validation, &attempt.error) {
            (Some(v), _) if v.is_pass() => format!(
                "- worker {} ({}): {:.2}x speedup",
                attempt.worker_id, attempt.strategy, v.speedup
            ),
            (Some(v), _) => format!(
                "- worker {} ({}): {} - {}",
                attempt.worker_id,
                attempt.strategy,
                v.status.as_str(),
                v.error.as_deref().unwrap_or("no detail")
            ),
            (None, Some(e)) => {
                format!("- worker {} ({}): error - {}", attempt.worker_id, attempt.strategy, e)
            },
            (None, None) => {
                format!("- worker {} ({}): not benchmarked", attempt.worker_id, attempt.strategy)
            },
        };
        lines.push(line);
    }
    lines.join("\n")
}

/// Generic optimization prompt for wave workers (the applicator's focused
/// per-transform prompt lives in the rewriter).
fn build_worker_prompt(
    sql: &str,
    dag: &SqlDag,
    examples: &[GoldExample],
    emphasis: &str,
    plan: Option<&OptimizationContext>,
    feedback: Option<&str>,
) -> String {
    let mut sections = vec![
        "Optimize this SQL query.\n\n\
         ## Algorithm\n\n\
         1. ANALYZE: Find where rows and cost are largest.\n\
         2. OPTIMIZE: For each bottleneck, ask what could reduce it earlier.\n\
            - Can a filter be pushed inside a CTE instead of applied after?\n\
            - Can a small table join happen before the big aggregation?\n\
            - Is there a correlated subquery? Convert to CTE + JOIN.\n\
         3. VERIFY: The result must be semantically equivalent.\n\n\
         Principle: reduce rows as early as possible."
            .to_string(),
        format!("## Strategy\n\n{emphasis}"),
    ];

    for example in examples {
        sections.push(example.to_prompt_section());
    }
    if let Some(plan) = plan {
        sections.push(plan.to_prompt_section());
    }
    if let Some(feedback) = feedback {
        sections.push(feedback.to_string());
    }

    if !dag.is_empty() {
        sections.push(dag.to_prompt(true));
        sections.push(
            "## Output\n\nReturn JSON with rewrites for each node you change:\n```json\n\
             {\n  \"rewrites\": {\"node_id\": \"complete rewritten SELECT\"},\n  \
             \"explanation\": \"what was optimized and why\"\n}\n```\n\n\
             For CTEs provide only the body. Results must be identical to the original."
                .to_string(),
        );
    } else {
        sections.push(
            "## Output\n\nReturn ONLY the optimized SQL query. No explanations, no markdown."
                .to_string(),
        );
    }

    sections.push(format!("## Original SQL\n```sql\n{}\n```", sql.trim()));
    sections.join("\n\n---\n\n")
}
