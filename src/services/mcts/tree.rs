//! MCTS tree operations: selection, expansion, simulation, backpropagation
//!
//! One iteration walks the tree by PUCT to a node with untried transforms,
//! applies one transform through the completer, validates the result, and
//! backpropagates the reward. Parallel iterations fan the completer calls
//! out concurrently but always validate sequentially: DB timing under
//! contention is noise.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;

use crate::config::SearchConfig;
use crate::models::{GoldExample, ValidationResult};
use crate::services::llm::Completer;
use crate::services::plan_analyzer::OptimizationContext;
use crate::services::registry::TransformRegistry;
use crate::services::rewriter::{RewriteError, Rewriter};
use crate::services::validator::SqlValidator;
use crate::utils::sql_state_hash;

use super::node::{MctsNode, NodeArena, NodeId};
use super::priors::{PriorConfig, compute_contextual_priors, ranking_to_priors};
use super::ranker::{AttemptSummary, rank_transforms, should_use_llm_ranking};
use super::reward::{RewardConfig, compute_reward};

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_iterations: usize,
    pub early_stop_speedup: f64,
    pub convergence_patience: usize,
    pub c_puct: f64,
    /// First-play urgency: exploitation value assumed for unvisited children
    pub fpu: f64,
    pub max_depth: usize,
    /// Concurrent completer calls per expansion; 1 = serial MCTS
    pub num_parallel: usize,
    pub completer_deadline: Duration,
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig, completer_deadline: Duration) -> Self {
        Self {
            max_iterations: config.max_iterations,
            // target_speedup caps the run even when early stop is set higher
            early_stop_speedup: config.early_stop_speedup.min(config.target_speedup),
            convergence_patience: config.convergence_patience,
            c_puct: config.c_puct,
            fpu: 0.5,
            max_depth: config.max_depth,
            num_parallel: config.num_parallel.max(1),
            completer_deadline,
        }
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            early_stop_speedup: 3.0,
            convergence_patience: 10,
            c_puct: 1.414,
            fpu: 0.5,
            max_depth: 5,
            num_parallel: 1,
            completer_deadline: Duration::from_secs(120),
        }
    }
}

/// Record of one transformation attempt, for provenance logs
#[derive(Debug, Clone, Serialize)]
pub struct TransformAttempt {
    pub iteration: usize,
    pub parent_path: Vec<String>,
    pub transform_id: String,
    pub llm_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_error: Option<String>,
    pub validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<String>,
    pub speedup: f64,
    pub reward: f64,
}

/// Final result of one search
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best_sql: String,
    pub best_validation: Option<ValidationResult>,
    pub transforms_applied: Vec<String>,
    pub explanation: String,
    pub iterations: usize,
    pub tree_size: usize,
    pub successful_expansions: usize,
    pub failed_expansions: usize,
    pub validation_calls: usize,
    pub attempts: Vec<TransformAttempt>,
}

impl SearchOutcome {
    /// True when the search produced a validated improvement over the root
    pub fn improved(&self) -> bool {
        self.best_validation.is_some()
    }
}

/// Monte-Carlo tree search over the transform library
pub struct SearchTree<'a> {
    arena: NodeArena,
    root: NodeId,
    original_sql: String,
    registry: &'a TransformRegistry,
    completer: &'a dyn Completer,
    validator: &'a SqlValidator<'a>,
    examples: Vec<GoldExample>,
    plan: Option<OptimizationContext>,
    options: SearchOptions,
    prior_config: PriorConfig,
    reward_config: RewardConfig,
    use_llm_ranking: bool,

    iterations: usize,
    successful_expansions: usize,
    failed_expansions: usize,
    validation_calls: usize,
    best_speedup: f64,
    attempts: Vec<TransformAttempt>,
    attempt_index: HashMap<NodeId, usize>,
    attempt_summary: HashMap<String, AttemptSummary>,
    explanations: HashMap<NodeId, String>,
}

impl<'a> SearchTree<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        original_sql: &str,
        registry: &'a TransformRegistry,
        completer: &'a dyn Completer,
        validator: &'a SqlValidator<'a>,
        examples: Vec<GoldExample>,
        plan: Option<OptimizationContext>,
        options: SearchOptions,
        prior_config: PriorConfig,
    ) -> Self {
        let use_llm_ranking = prior_config.use_llm_ranking;
        let candidates: Vec<String> =
            registry.enabled().into_iter().map(|t| t.id).collect();
        let priors =
            compute_contextual_priors(original_sql, &candidates, &[], registry, &prior_config);
        let remaining = ordered_by_prior(&candidates, &priors);

        let (arena, root) = NodeArena::new_root(
            original_sql.to_string(),
            sql_state_hash(original_sql),
            remaining,
        );

        Self {
            arena,
            root,
            original_sql: original_sql.to_string(),
            registry,
            completer,
            validator,
            examples,
            plan,
            options,
            prior_config,
            reward_config: RewardConfig::default(),
            use_llm_ranking,
            iterations: 0,
            successful_expansions: 0,
            failed_expansions: 0,
            validation_calls: 0,
            best_speedup: 1.0,
            attempts: Vec::new(),
            attempt_index: HashMap::new(),
            attempt_summary: HashMap::new(),
            explanations: HashMap::new(),
        }
    }

    /// Run the search to termination and return the best rewrite.
    ///
    /// Stops at max_iterations, on early_stop_speedup, or after
    /// convergence_patience iterations without best improvement.
    pub async fn run(&mut self) -> SearchOutcome {
        let mut stale_iterations = 0;

        while self.iterations < self.options.max_iterations {
            let before = self.best_speedup;

            if self.options.num_parallel > 1 {
                self.iterate_parallel().await;
            } else {
                self.iterate().await;
            }

            if self.best_speedup >= self.options.early_stop_speedup {
                tracing::info!(
                    "Early stop: {:.2}x >= {:.2}x after {} iterations",
                    self.best_speedup,
                    self.options.early_stop_speedup,
                    self.iterations
                );
                break;
            }

            if self.best_speedup > before {
                stale_iterations = 0;
            } else {
                stale_iterations += 1;
                if stale_iterations >= self.options.convergence_patience {
                    tracing::info!(
                        "Converged: no improvement in {} iterations",
                        stale_iterations
                    );
                    break;
                }
            }
        }

        self.outcome()
    }

    /// One serial MCTS iteration
    pub async fn iterate(&mut self) {
        self.iterations += 1;

        let selected = self.select();
        self.maybe_rank(selected).await;

        match self.expand_one(selected).await {
            Some(child) => {
                let reward = self.simulate(child).await;
                self.backpropagate(child, reward);
            },
            None => {
                self.backpropagate(selected, 0.0);
            },
        }
    }

    /// One iteration with parallel completer calls and sequential validation
    pub async fn iterate_parallel(&mut self) {
        self.iterations += 1;

        let selected = self.select();
        self.maybe_rank(selected).await;

        let children = self.expand_parallel(selected, self.options.num_parallel).await;
        if children.is_empty() {
            self.backpropagate(selected, 0.0);
            return;
        }

        // Validation holds the DB: strictly one child at a time
        for child in children {
            let reward = self.simulate(child).await;
            self.backpropagate(child, reward);
        }
    }

    /// Walk from the root picking the best PUCT child until reaching a node
    /// with untried transforms, a terminal node, or the depth bound.
    fn select(&self) -> NodeId {
        let mut node_id = self.root;
        loop {
            let node = self.arena.get(node_id);
            if !node.remaining_transforms.is_empty() {
                return node_id;
            }
            if node.children.is_empty() {
                return node_id;
            }
            if node.depth >= self.options.max_depth {
                return node_id;
            }

            let parent_visits = node.visit_count;
            let mut best: Option<(NodeId, f64)> = None;
            for &child_id in node.children.values() {
                let score = self.arena.get(child_id).puct_score(
                    parent_visits,
                    self.options.c_puct,
                    self.options.fpu,
                );
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((child_id, score));
                }
            }
            match best {
                Some((child_id, _)) => node_id = child_id,
                None => return node_id,
            }
        }
    }

    /// Re-rank a node's untried transforms via the completer when the gate
    /// fires. Every failure falls back silently to the contextual order.
    async fn maybe_rank(&mut self, node_id: NodeId) {
        if !self.use_llm_ranking {
            return;
        }
        let node = self.arena.get(node_id);
        if node.remaining_transforms.len() < 2 {
            return;
        }

        let children_rewards: Vec<f64> =
            node.children.values().map(|&c| self.arena.get(c).avg_reward()).collect();
        if !should_use_llm_ranking(
            node.visit_count,
            node.avg_reward(),
            node.remaining_transforms.len(),
            &children_rewards,
        ) {
            return;
        }

        let candidates: Vec<String> =
            node.remaining_transforms.iter().map(|(t, _)| t.clone()).collect();
        let sql = node.query_sql.clone();
        let applied = self.arena.path_transforms(node_id);
        let plan_text = self.plan.as_ref().map(|p| p.to_prompt_section());

        let ranking = rank_transforms(
            self.completer,
            &candidates,
            &sql,
            &applied,
            self.registry,
            plan_text.as_deref(),
            &self.attempt_summary,
            self.prior_config.llm_timeout,
        )
        .await;

        if let Some(ranking) = ranking {
            let priors = ranking_to_priors(&ranking, &candidates);
            self.arena.get_mut(node_id).remaining_transforms =
                ordered_by_prior(&ranking, &priors);
            tracing::debug!("LLM ranking applied at node {}: {:?}", node_id, ranking);
        }
    }

    /// Apply the highest-prior untried transform at `node_id`.
    ///
    /// Failures (completer error, no-op, cycle) create a failed child with
    /// no remaining transforms so PUCT eventually abandons the branch.
    async fn expand_one(&mut self, node_id: NodeId) -> Option<NodeId> {
        if self.arena.get(node_id).depth >= self.options.max_depth {
            return None;
        }
        let (transform_id, prior) = {
            let node = self.arena.get_mut(node_id);
            if node.remaining_transforms.is_empty() {
                return None;
            }
            node.expanded = true;
            node.remaining_transforms.remove(0)
        };

        let parent_sql = self.arena.get(node_id).query_sql.clone();
        let rewriter = Rewriter::new(self.registry);
        let result = rewriter
            .apply(
                &parent_sql,
                &transform_id,
                self.completer,
                &self.examples,
                self.plan.as_ref(),
                self.options.completer_deadline,
            )
            .await;

        self.attach_child(node_id, &transform_id, prior, result)
    }

    /// Apply up to `width` untried transforms with concurrent completer
    /// calls. Children are created but not yet validated.
    async fn expand_parallel(&mut self, node_id: NodeId, width: usize) -> Vec<NodeId> {
        if self.arena.get(node_id).depth >= self.options.max_depth {
            return Vec::new();
        }
        let picks: Vec<(String, f64)> = {
            let node = self.arena.get_mut(node_id);
            if node.remaining_transforms.is_empty() {
                return Vec::new();
            }
            node.expanded = true;
            let take = width.min(node.remaining_transforms.len());
            node.remaining_transforms.drain(..take).collect()
        };

        let parent_sql = self.arena.get(node_id).query_sql.clone();
        let rewriter = Rewriter::new(self.registry);

        let calls = picks.iter().map(|(transform_id, _)| {
            rewriter.apply(
                &parent_sql,
                transform_id,
                self.completer,
                &self.examples,
                self.plan.as_ref(),
                self.options.completer_deadline,
            )
        });
        let results = join_all(calls).await;

        let mut children = Vec::new();
        for ((transform_id, prior), result) in picks.into_iter().zip(results) {
            if let Some(child) = self.attach_child(node_id, &transform_id, prior, result) {
                children.push(child);
            }
        }
        children
    }

    /// Create the child node for an expansion result; None when it failed
    fn attach_child(
        &mut self,
        node_id: NodeId,
        transform_id: &str,
        prior: f64,
        result: Result<crate::services::rewriter::RewriteOutcome, RewriteError>,
    ) -> Option<NodeId> {
        let parent_sql = self.arena.get(node_id).query_sql.clone();
        let parent_path = self.arena.path_transforms(node_id);

        let mut attempt = TransformAttempt {
            iteration: self.iterations,
            parent_path,
            transform_id: transform_id.to_string(),
            llm_success: false,
            llm_error: None,
            validated: false,
            validation_status: None,
            speedup: 1.0,
            reward: 0.0,
        };
        let summary = self.attempt_summary.entry(transform_id.to_string()).or_default();
        summary.total += 1;

        match result {
            Err(e) => {
                summary.llm_failed += 1;
                attempt.llm_error = Some(e.to_string());
                self.attempts.push(attempt);

                let parent_hash = self.arena.get(node_id).state_hash.clone();
                let child = self.arena.add_child(
                    node_id,
                    transform_id,
                    parent_sql,
                    parent_hash,
                    prior,
                    Vec::new(),
                );
                self.attempt_index.insert(child, self.attempts.len() - 1);
                self.arena.get_mut(child).transform_error = Some(e.to_string());
                self.failed_expansions += 1;
                tracing::debug!("Transform {} failed: {}", transform_id, e);
                None
            },
            Ok(outcome) => {
                let hash = sql_state_hash(&outcome.sql);
                if self.arena.hash_on_path(node_id, &hash) {
                    summary.llm_failed += 1;
                    attempt.llm_error = Some("cycle: state already on path".to_string());
                    self.attempts.push(attempt);

                    let child = self.arena.add_child(
                        node_id,
                        transform_id,
                        parent_sql,
                        hash,
                        prior,
                        Vec::new(),
                    );
                    self.attempt_index.insert(child, self.attempts.len() - 1);
                    self.arena.get_mut(child).transform_error =
                        Some("cycle: state already on path".to_string());
                    self.failed_expansions += 1;
                    return None;
                }

                attempt.llm_success = true;
                self.attempts.push(attempt);

                let mut applied = self.arena.path_transforms(node_id);
                applied.push(transform_id.to_string());
                let candidates: Vec<String> =
                    self.registry.enabled().into_iter().map(|t| t.id).collect();
                let priors = compute_contextual_priors(
                    &outcome.sql,
                    &candidates,
                    &applied,
                    self.registry,
                    &self.prior_config,
                );
                let remaining = ordered_by_prior(&candidates, &priors);

                let child = self.arena.add_child(
                    node_id,
                    transform_id,
                    outcome.sql,
                    hash,
                    prior,
                    remaining,
                );
                self.attempt_index.insert(child, self.attempts.len() - 1);
                if !outcome.explanation.is_empty() {
                    self.explanations.insert(child, outcome.explanation);
                }
                self.successful_expansions += 1;
                tracing::debug!("Transform {} applied successfully", transform_id);
                Some(child)
            },
        }
    }

    /// Validate the node's SQL (cached) and compute its reward
    async fn simulate(&mut self, node_id: NodeId) -> f64 {
        if self.arena.get(node_id).transform_error.is_some() {
            return 0.0;
        }
        if let Some(cached) = &self.arena.get(node_id).validation {
            return compute_reward(cached, &self.reward_config);
        }

        let sql = self.arena.get(node_id).query_sql.clone();
        let result = self.validator.validate(&self.original_sql, &sql).await;
        self.validation_calls += 1;

        let reward = compute_reward(&result, &self.reward_config);
        tracing::debug!(
            "Validation: status={}, speedup={:.2}x, reward={:.3}",
            result.status.as_str(),
            result.speedup,
            reward
        );

        if let Some(transform) = self.arena.get(node_id).transform.clone() {
            let summary = self.attempt_summary.entry(transform).or_default();
            if result.is_pass() {
                summary.validation_pass += 1;
                let n = summary.validation_pass as f64;
                summary.avg_speedup = (summary.avg_speedup * (n - 1.0) + result.speedup) / n;
                summary.max_speedup = summary.max_speedup.max(result.speedup);
            } else {
                summary.validation_fail += 1;
            }
        }
        if let Some(&idx) = self.attempt_index.get(&node_id) {
            let attempt = &mut self.attempts[idx];
            attempt.validated = true;
            attempt.validation_status = Some(result.status.as_str().to_string());
            attempt.speedup = result.speedup;
            attempt.reward = reward;
        }

        if result.is_pass() && result.speedup > self.best_speedup {
            self.best_speedup = result.speedup;
        }
        self.arena.get_mut(node_id).validation = Some(result);
        reward
    }

    /// Add reward and a visit to every node from `node_id` up to the root
    fn backpropagate(&mut self, node_id: NodeId, reward: f64) {
        let mut current = Some(node_id);
        while let Some(id) = current {
            let node = self.arena.get_mut(id);
            node.visit_count += 1;
            node.value_sum += reward;
            current = node.parent;
        }
    }

    /// Best node: highest visit count among valid descendants (robust),
    /// ties broken by avg reward, then by shortest path.
    fn best_node(&self) -> NodeId {
        let mut best = self.root;
        let mut best_key: Option<(u64, f64, std::cmp::Reverse<usize>)> = None;

        for id in self.arena.ids() {
            let node = self.arena.get(id);
            if !node.is_valid() {
                continue;
            }
            let key = (node.visit_count, node.avg_reward(), std::cmp::Reverse(node.depth));
            let better = match &best_key {
                None => true,
                Some(current) => {
                    key.0 > current.0
                        || (key.0 == current.0 && key.1 > current.1)
                        || (key.0 == current.0 && key.1 == current.1 && key.2 > current.2)
                },
            };
            if better {
                best = id;
                best_key = Some(key);
            }
        }
        best
    }

    fn outcome(&self) -> SearchOutcome {
        let best = self.best_node();
        let node = self.arena.get(best);

        SearchOutcome {
            best_sql: node.query_sql.clone(),
            best_validation: node.validation.clone().filter(|v| v.is_pass()),
            transforms_applied: self.arena.path_transforms(best),
            explanation: self.explanations.get(&best).cloned().unwrap_or_default(),
            iterations: self.iterations,
            tree_size: self.arena.len(),
            successful_expansions: self.successful_expansions,
            failed_expansions: self.failed_expansions,
            validation_calls: self.validation_calls,
            attempts: self.attempts.clone(),
        }
    }

    /// Tree statistics for logs
    pub fn node(&self, id: NodeId) -> &MctsNode {
        self.arena.get(id)
    }

    pub fn tree_size(&self) -> usize {
        self.arena.len()
    }
}

fn ordered_by_prior(candidates: &[String], priors: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut out: Vec<(String, f64)> = candidates
        .iter()
        .map(|id| (id.clone(), priors.get(id).copied().unwrap_or(0.0)))
        .collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    out
}
