//! Transform registry - the single source of truth for rewrite patterns
//!
//! All services (MCTS priors, opportunity detection, prompt building,
//! auto-promotion) read from here. Transforms can be disabled or upserted
//! but never removed.

use dashmap::DashMap;

use crate::models::{Transform, TransformCategory};

/// Process-wide mapping of transform id -> Transform
pub struct TransformRegistry {
    transforms: DashMap<String, Transform>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TransformRegistry {
    /// Empty registry (tests only; production always seeds builtins)
    pub fn empty() -> Self {
        Self { transforms: DashMap::new() }
    }

    /// Registry seeded with the canonical transform set
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        for t in builtin_transforms() {
            registry.transforms.insert(t.id.clone(), t);
        }
        registry
    }

    pub fn get(&self, id: &str) -> Option<Transform> {
        self.transforms.get(id).map(|t| t.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transforms.contains_key(id)
    }

    /// All transforms, sorted by id for deterministic iteration
    pub fn all(&self) -> Vec<Transform> {
        let mut out: Vec<Transform> = self.transforms.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Enabled transforms only, sorted by descending weight then id
    pub fn enabled(&self) -> Vec<Transform> {
        let mut out: Vec<Transform> = self
            .transforms
            .iter()
            .filter(|e| e.value().enabled)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn by_category(&self, category: TransformCategory) -> Vec<Transform> {
        let mut out: Vec<Transform> = self
            .transforms
            .iter()
            .filter(|e| e.value().category == category)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Create or update a transform by id. Used by auto-promotion.
    ///
    /// Weight is clamped to [1, 10]. Removal is forbidden; there is no
    /// delete operation, only `disable`.
    pub fn upsert(&self, mut transform: Transform) {
        transform.weight = transform.weight.clamp(1, 10);
        tracing::debug!("Registry upsert: {}", transform.id);
        self.transforms.insert(transform.id.clone(), transform);
    }

    /// Disable a transform; returns false for unknown ids
    pub fn disable(&self, id: &str) -> bool {
        match self.transforms.get_mut(id) {
            Some(mut entry) => {
                entry.enabled = false;
                true
            },
            None => false,
        }
    }

    /// KB weight as a prior baseline (5.0 for unknown transforms)
    pub fn weight_of(&self, id: &str) -> f64 {
        self.transforms.get(id).map(|t| t.weight as f64).unwrap_or(5.0)
    }
}

fn transform(
    id: &str,
    code: &str,
    name: &str,
    description: &str,
    trigger: &str,
    rewrite_hint: &str,
    weight: u8,
    benchmark_queries: &[&str],
    category: TransformCategory,
) -> Transform {
    Transform {
        id: id.to_string(),
        code: code.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        trigger: trigger.to_string(),
        rewrite_hint: rewrite_hint.to_string(),
        weight,
        benchmark_queries: benchmark_queries.iter().map(|q| q.to_string()).collect(),
        category,
        enabled: true,
        avg_speedup: None,
    }
}

/// Canonical transform set.
///
/// Speedup evidence is from TPC-DS SF100 on DuckDB: or_to_union 2.98x (Q15),
/// correlated_to_cte 2.81x (Q1), date_cte_isolate 2.67x (Q15), push_pred
/// 2.71x (Q93), consolidate_scans 1.84x (Q90).
fn builtin_transforms() -> Vec<Transform> {
    use TransformCategory::{HighValue, Standard};

    vec![
        transform(
            "push_pred",
            "QT-OPT-001",
            "Predicate Pushdown",
            "Push WHERE conditions as close to base tables as possible",
            "WHERE predicates reference columns from tables deep in the join tree",
            "Move predicates that filter on a single table into that table's subquery \
             or join condition; push through inner joins and into CTEs when the filter \
             only touches CTE columns. Never change join types, column lists, or \
             aggregations.",
            7,
            &["Q93"],
            Standard,
        ),
        transform(
            "multi_push_pred",
            "QT-OPT-002",
            "Multi-Layer Predicate Pushdown",
            "Push predicates through multiple CTE/subquery layers to the earliest point",
            "Filter applied above a chain of CTEs whose grouping columns carry it",
            "Trace filter columns back through CTEs to their source tables and push the \
             filter to the earliest layer. Only push through GROUP BY when the filter \
             column is a grouping column; keep the original filter in place and let the \
             engine eliminate the redundancy.",
            6,
            &[],
            Standard,
        ),
        transform(
            "reorder_join",
            "QT-OPT-003",
            "Join Reordering",
            "Reorder joins to put most selective tables first",
            "3+ table join where a strongly filtered or small table joins late",
            "Put tables with strong filter predicates earlier in the join order; \
             dimension tables generally before fact tables. Preserve every predicate \
             exactly and keep all column references valid.",
            5,
            &[],
            Standard,
        ),
        transform(
            "materialize_cte",
            "QT-OPT-004",
            "CTE Materialization",
            "Convert repeated subqueries into shared CTEs",
            "Same subquery pattern appears two or more times",
            "Extract the repeated subexpression into a named CTE and reference it from \
             each use site. Name CTEs by what they compute; results must be unchanged.",
            5,
            &[],
            Standard,
        ),
        transform(
            "inline_cte",
            "QT-OPT-005",
            "CTE Inlining",
            "Inline single-use CTEs back into the main query",
            "CTE referenced exactly once and not an aggregation barrier",
            "Inline CTEs that are used only once or are simple filtered scans; keep \
             CTEs that are referenced multiple times or hold complex aggregations.",
            4,
            &[],
            Standard,
        ),
        transform(
            "flatten_subq",
            "QT-OPT-006",
            "Subquery Flattening",
            "Convert correlated subqueries to equivalent JOINs",
            "Correlated EXISTS/IN/scalar subquery referencing the outer scope",
            "Convert EXISTS to semi-joins, NOT EXISTS to anti-joins (LEFT JOIN + IS \
             NULL), IN to joins, and scalar subqueries to LEFT JOINs when safe. If \
             exact semantics (rows, values, cardinality) cannot be preserved, do not \
             transform.",
            6,
            &[],
            Standard,
        ),
        transform(
            "remove_redundant",
            "QT-OPT-007",
            "Redundancy Removal",
            "Remove operations that cannot affect results",
            "DISTINCT covered by GROUP BY, unused subquery columns, redundant ORDER BY",
            "Drop DISTINCT when the rows are already unique, unused columns from \
             subqueries, and ORDER BY in subqueries shadowed by the outer query. When \
             in doubt, keep the clause.",
            3,
            &[],
            Standard,
        ),
        transform(
            "or_to_union",
            "QT-OPT-008",
            "OR to UNION ALL Decomposition",
            "Split complex OR conditions into separate queries combined with UNION ALL",
            "WHERE with OR spanning different columns, forcing a full scan",
            "Split each OR branch into its own CTE or subquery and combine with UNION \
             ALL, excluding previous branches' conditions to avoid duplicates; push \
             common filters into every branch. Only apply when the OR spans different \
             columns.",
            9,
            &["Q15"],
            HighValue,
        ),
        transform(
            "correlated_to_cte",
            "QT-OPT-009",
            "Correlated Subquery to Precomputed CTE",
            "Replace per-row correlated aggregates with a pre-computed CTE joined in",
            "Correlated subquery computing AVG/SUM/COUNT per group for a threshold test",
            "Pre-compute the aggregate grouped by the correlation key in a new CTE and \
             replace the correlated subquery with a JOIN against it. This turns \
             per-outer-row re-execution into a single pre-aggregation.",
            9,
            &["Q1"],
            HighValue,
        ),
        transform(
            "date_cte_isolate",
            "QT-OPT-010",
            "Date CTE Isolation",
            "Extract date dimension filtering into a small early CTE",
            "Date dimension joined with selective filters (year, quarter, month)",
            "Select only the surrogate key from the date dimension under the filter in \
             a tiny CTE, join fact tables against it, and drop the date filter from the \
             main WHERE. The small CTE materializes early and enables partition \
             pruning.",
            8,
            &["Q6", "Q15", "Q27"],
            HighValue,
        ),
        transform(
            "consolidate_scans",
            "QT-OPT-011",
            "Scan Consolidation",
            "Merge multiple scans of one table into a single conditional-aggregate scan",
            "Same base table scanned in 2+ scopes with different filters",
            "Combine the scans into one pass using CASE WHEN inside the aggregates and \
             a union of the filter ranges in WHERE; use HAVING to drop groups with no \
             matches per branch. Mind NULL semantics of CASE without ELSE.",
            7,
            &["Q90"],
            HighValue,
        ),
    ]
}
