//! Prompt assembly for the applicator
//!
//! Each transform gets a focused prompt that applies exactly one kind of
//! rewrite. The DAG structure plus the rewrites output format keeps the
//! completer's answer small and mechanically checkable.

use crate::models::{GoldExample, Transform};
use crate::services::plan_analyzer::OptimizationContext;
use crate::services::sql_dag::SqlDag;

/// Per-transform rules appended below the rewrite hint
fn rules_for(transform_id: &str) -> &'static str {
    match transform_id {
        "push_pred" => {
            "1. Move predicates that filter a single table into that table's subquery or join condition\n\
             2. Push predicates through inner joins when safe\n\
             3. Push predicates into CTEs if they filter on CTE columns only\n\
             4. Do NOT change join types, column lists, or aggregations"
        },
        "multi_push_pred" => {
            "1. Trace filter columns back through CTEs to find source tables\n\
             2. Push filters through GROUP BY ONLY if the filter column IS a GROUP BY column\n\
             3. Push filters through JOINs when they apply to one side only\n\
             4. Keep the original filter in place; the engine eliminates the redundancy\n\
             5. Adjust column names if intermediate layers alias them differently"
        },
        "reorder_join" => {
            "1. Put tables with strong filter predicates earlier in the join order\n\
             2. Dimension tables (smaller) before fact tables (larger)\n\
             3. Preserve all predicates exactly; add or remove none\n\
             4. Keep all column references valid after reordering"
        },
        "materialize_cte" => {
            "1. Extract subquery patterns that appear multiple times into a CTE\n\
             2. Name CTEs descriptively based on what they compute\n\
             3. Preserve all column names and orderings"
        },
        "inline_cte" => {
            "1. Inline CTEs that are used only once\n\
             2. Inline simple CTEs (just a table scan with filters)\n\
             3. Keep CTEs that are used multiple times or hold complex aggregations"
        },
        "flatten_subq" => {
            "1. Convert EXISTS subqueries to SEMI JOINs or JOINs with DISTINCT\n\
             2. Convert NOT EXISTS to anti-joins (LEFT JOIN + IS NULL check)\n\
             3. Convert IN subqueries to JOINs\n\
             4. Convert scalar subqueries in SELECT to LEFT JOINs when safe\n\
             5. If unsure about semantics preservation, do NOT transform"
        },
        "remove_redundant" => {
            "1. Remove DISTINCT if the query already returns unique rows\n\
             2. Remove unused columns from subqueries (never the final SELECT)\n\
             3. Remove ORDER BY in subqueries shadowed by the outer query\n\
             4. When in doubt, keep the clause"
        },
        "or_to_union" => {
            "1. Split each OR branch into a separate CTE or subquery\n\
             2. Exclude previous branches' conditions to avoid duplicate rows\n\
             3. If exact deduplication is complex, combine with UNION instead of UNION ALL\n\
             4. Push common filters (like date filters) into each branch\n\
             5. Only apply when the OR spans DIFFERENT columns"
        },
        "correlated_to_cte" => {
            "1. Identify the correlation key (the grouping column in the subquery)\n\
             2. Pre-compute the aggregate GROUP BY that key in a new CTE\n\
             3. Replace the correlated subquery with a JOIN to the new CTE\n\
             4. Handle NULL-safety: the JOIN must exclude the same rows the WHERE did"
        },
        "date_cte_isolate" => {
            "1. Extract the date filter into a CTE selecting ONLY the surrogate key column\n\
             2. Replace the date dimension join with a join to the filtered CTE\n\
             3. Remove the date filter from the main WHERE clause (now in the CTE)\n\
             4. If multiple scopes need the same date filter, reuse one date CTE"
        },
        "consolidate_scans" => {
            "1. Merge repeated scans of the same base table into one scan\n\
             2. Use CASE WHEN inside the aggregates for per-branch results\n\
             3. Combine the branch filters with OR (or a superset range) in WHERE\n\
             4. Use HAVING to drop groups with no matches in a branch\n\
             5. Mind NULLs: SUM(CASE WHEN ... THEN x END) yields NULL, not 0"
        },
        _ => "1. Apply the rewrite described above\n2. Preserve exact query semantics",
    }
}

/// Build the focused rewrite prompt for one transform application
pub fn build_rewrite_prompt(
    transform: &Transform,
    sql: &str,
    dag: &SqlDag,
    examples: &[GoldExample],
    plan: Option<&OptimizationContext>,
) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are a SQL optimizer. Apply ONLY this optimization: {}.\n\nTASK: {}\n\nRewrite approach: {}\n\nRules:\n{}",
        transform.name,
        transform.description,
        transform.rewrite_hint,
        rules_for(&transform.id),
    ));

    for example in examples {
        sections.push(example.to_prompt_section());
    }

    if let Some(plan) = plan {
        sections.push(plan.to_prompt_section());
    }

    if !dag.is_empty() {
        sections.push(dag.to_prompt(true));
        let node_list: Vec<String> = dag
            .topological_order()
            .iter()
            .filter_map(|id| dag.get_node(id))
            .map(|n| format!("- `{}` ({:?})", n.id, n.node_type))
            .collect();
        sections.push(format!(
            "## Output\n\nReturn JSON with rewrites for each node you change:\n```json\n{{\n  \"rewrites\": {{\"node_id\": \"complete rewritten SELECT for this node\"}},\n  \"explanation\": \"what was optimized and why\"\n}}\n```\n\nRules:\n1. Only include nodes you are actually changing\n2. Each rewrite must be a complete, valid SELECT statement\n3. Preserve column names/aliases for downstream compatibility\n4. For CTEs, provide only the body (not \"WITH cte AS (...)\")\n5. Results must be identical to the original\n\nAvailable nodes:\n{}",
            node_list.join("\n"),
        ));
    } else {
        sections.push(
            "## Output\n\nReturn JSON:\n```json\n{\n  \"patches\": [\n    {\"search\": \"exact text from the SQL\", \"replace\": \"new text\", \"description\": \"why\"}\n  ],\n  \"explanation\": \"summary\"\n}\n```\n\nRules: search must match exactly (whitespace-insensitive fallback is applied), patches apply in order, valid JSON only."
                .to_string(),
        );
    }

    sections.push(format!("## Original SQL\n```sql\n{}\n```", sql.trim()));

    sections.join("\n\n---\n\n")
}
