//! PUCT prior computation
//!
//! Priors come from three sources, best available wins:
//! 1. KB weights (baseline, always available)
//! 2. Contextual adjustments (opportunity detection, category, path history)
//! 3. LLM ranking (optional, gated, with silent fallback)
//!
//! Whatever the source, priors over a node's candidates always sum to 1.

use std::collections::HashMap;
use std::time::Duration;

use crate::services::registry::TransformRegistry;
use crate::services::sql_dag::{SqlDag, detect};
use crate::models::TransformCategory;

#[derive(Debug, Clone)]
pub struct PriorConfig {
    /// PUCT with informed priors; false flattens priors to uniform (the
    /// original random-order selection, kept for A/B comparison)
    pub use_puct: bool,
    pub use_opportunity_detection: bool,
    pub use_llm_ranking: bool,
    /// Multiplier for transforms matched by opportunity detection
    pub opportunity_boost: f64,
    /// Multiplier for high_value category transforms
    pub high_value_boost: f64,
    /// Multiplier for transforms already applied on the path
    pub diminishing_returns_penalty: f64,
    pub llm_timeout: Duration,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            use_puct: true,
            use_opportunity_detection: true,
            use_llm_ranking: false,
            opportunity_boost: 1.5,
            high_value_boost: 1.2,
            diminishing_returns_penalty: 0.5,
            llm_timeout: Duration::from_millis(5000),
        }
    }
}

/// Baseline priors: KB weight normalized across candidates
pub fn compute_weight_priors(
    candidates: &[String],
    registry: &TransformRegistry,
) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let weights: HashMap<String, f64> =
        candidates.iter().map(|id| (id.clone(), registry.weight_of(id))).collect();
    normalize(weights)
}

/// Context-aware priors: weight baseline with opportunity, category, and
/// diminishing-returns adjustments, re-normalized.
pub fn compute_contextual_priors(
    sql: &str,
    candidates: &[String],
    applied: &[String],
    registry: &TransformRegistry,
    config: &PriorConfig,
) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    if !config.use_puct {
        let uniform = 1.0 / candidates.len() as f64;
        return candidates.iter().map(|id| (id.clone(), uniform)).collect();
    }

    let mut priors = compute_weight_priors(candidates, registry);

    let opportunity_ids: std::collections::HashSet<String> = if config.use_opportunity_detection {
        let dag = SqlDag::from_sql(sql);
        detect::detect_opportunities(&dag, registry)
            .into_iter()
            .map(|o| o.transform_id)
            .collect()
    } else {
        Default::default()
    };

    for (id, weight) in priors.iter_mut() {
        if opportunity_ids.contains(id) {
            *weight *= config.opportunity_boost;
        }
        if let Some(t) = registry.get(id) {
            if t.category == TransformCategory::HighValue {
                *weight *= config.high_value_boost;
            }
        }
        if applied.contains(id) {
            *weight *= config.diminishing_returns_penalty;
        }
    }

    normalize(priors)
}

/// Fixed distribution for an ordered LLM ranking:
/// [0.35, 0.25, 0.15, 0.10, 0.05], remainder split over the rest.
/// Candidates missing from the ranking get a small floor prior.
pub fn ranking_to_priors(ranking: &[String], candidates: &[String]) -> HashMap<String, f64> {
    if ranking.is_empty() {
        let n = candidates.len().max(1);
        return candidates.iter().map(|id| (id.clone(), 1.0 / n as f64)).collect();
    }

    const TOP: [f64; 5] = [0.35, 0.25, 0.15, 0.10, 0.05];
    let covered: f64 = TOP[..TOP.len().min(ranking.len())].iter().sum();
    let remainder = 1.0 - covered;
    let num_tail = ranking.len().saturating_sub(TOP.len());

    let mut priors: HashMap<String, f64> = HashMap::new();
    for (i, id) in ranking.iter().enumerate() {
        let p = if i < TOP.len() {
            TOP[i]
        } else if num_tail > 0 {
            remainder / num_tail as f64
        } else {
            0.01
        };
        priors.insert(id.clone(), p);
    }

    for id in candidates {
        priors.entry(id.clone()).or_insert(0.01);
    }

    normalize(priors)
}

fn normalize(mut priors: HashMap<String, f64>) -> HashMap<String, f64> {
    let total: f64 = priors.values().sum();
    if total <= 0.0 {
        let n = priors.len().max(1);
        for v in priors.values_mut() {
            *v = 1.0 / n as f64;
        }
        return priors;
    }
    for v in priors.values_mut() {
        *v /= total;
    }
    priors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn assert_sums_to_one(priors: &HashMap<String, f64>) {
        let total: f64 = priors.values().sum();
        assert!((total - 1.0).abs() < 1e-9, "priors sum to {total}");
        assert!(priors.values().all(|&p| p >= 0.0));
    }

    #[test]
    fn test_weight_priors_proportional_and_normalized() {
        let registry = TransformRegistry::with_builtins();
        let candidates = ids(&["or_to_union", "remove_redundant"]);
        let priors = compute_weight_priors(&candidates, &registry);
        assert_sums_to_one(&priors);
        // weight 9 vs weight 3
        assert!((priors["or_to_union"] - 0.75).abs() < 1e-9);
        assert!((priors["remove_redundant"] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_contextual_boosts_detected_opportunity() {
        let registry = TransformRegistry::with_builtins();
        let config = PriorConfig::default();
        let candidates = ids(&["or_to_union", "reorder_join", "inline_cte", "push_pred"]);

        let sql = "SELECT * FROM t WHERE a = 1 OR b = 2";
        let contextual = compute_contextual_priors(sql, &candidates, &[], &registry, &config);
        let baseline = compute_weight_priors(&candidates, &registry);

        assert_sums_to_one(&contextual);
        // Detected + high_value: boost must be at least 1.2x baseline share
        assert!(contextual["or_to_union"] >= baseline["or_to_union"] * 1.2);
    }

    #[test]
    fn test_applied_transform_penalized() {
        let registry = TransformRegistry::with_builtins();
        let config = PriorConfig::default();
        let candidates = ids(&["push_pred", "reorder_join"]);

        let free = compute_contextual_priors("SELECT 1", &candidates, &[], &registry, &config);
        let after = compute_contextual_priors(
            "SELECT 1",
            &candidates,
            &ids(&["push_pred"]),
            &registry,
            &config,
        );
        assert_sums_to_one(&after);
        assert!(after["push_pred"] < free["push_pred"]);
        assert!(after["reorder_join"] > free["reorder_join"]);
    }

    #[test]
    fn test_ranking_distribution() {
        let candidates = ids(&["a", "b", "c", "d", "e", "f", "g"]);
        let priors = ranking_to_priors(&candidates, &candidates);
        assert_sums_to_one(&priors);
        assert!(priors["a"] > priors["b"]);
        assert!(priors["b"] > priors["c"]);
        assert!(priors["c"] > priors["d"]);
        // Tail ranks split the remainder evenly
        assert!((priors["f"] - priors["g"]).abs() < 1e-9);
    }

    #[test]
    fn test_ranking_covers_missing_candidates() {
        let ranking = ids(&["a", "b"]);
        let candidates = ids(&["a", "b", "c"]);
        let priors = ranking_to_priors(&ranking, &candidates);
        assert_sums_to_one(&priors);
        assert!(priors["c"] > 0.0);
        assert!(priors["c"] < priors["b"]);
    }

    #[test]
    fn test_empty_candidates() {
        let registry = TransformRegistry::with_builtins();
        assert!(compute_weight_priors(&[], &registry).is_empty());
    }

    #[test]
    fn test_puct_disabled_flattens_priors() {
        let registry = TransformRegistry::with_builtins();
        let config = PriorConfig { use_puct: false, ..PriorConfig::default() };
        let candidates = ids(&["or_to_union", "remove_redundant", "push_pred"]);

        let priors = compute_contextual_priors(
            "SELECT * FROM t WHERE a = 1 OR b = 2",
            &candidates,
            &[],
            &registry,
            &config,
        );
        assert_sums_to_one(&priors);
        for p in priors.values() {
            assert!((p - 1.0 / 3.0).abs() < 1e-9);
        }
    }
}
