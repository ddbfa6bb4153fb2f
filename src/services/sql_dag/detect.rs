//! Structural opportunity detection
//!
//! Matches each registered transform's trigger against the facts captured in
//! the DAG. Detection produces candidates, not decisions: the priors boost
//! detected transforms, and the validator has the final word.

use std::collections::HashMap;

use crate::models::Opportunity;
use crate::services::registry::TransformRegistry;

use super::{NodeType, SqlDag};

/// Detect all transform opportunities in a query.
///
/// Purely structural; an unparseable query (empty DAG) yields no
/// opportunities.
pub fn detect_opportunities(dag: &SqlDag, registry: &TransformRegistry) -> Vec<Opportunity> {
    if dag.is_empty() {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut push = |transform_id: &str, node_id: &str, evidence: String| {
        if registry.get(transform_id).map(|t| t.enabled).unwrap_or(false) {
            found.push(Opportunity {
                transform_id: transform_id.to_string(),
                node_id: node_id.to_string(),
                evidence,
            });
        }
    };

    // Table -> scopes that scan it, for repeated-scan triggers
    let mut scans_by_table: HashMap<String, Vec<&str>> = HashMap::new();
    for node in dag.nodes() {
        for table in &node.tables {
            scans_by_table.entry(table.to_lowercase()).or_default().push(&node.id);
        }
    }

    for node in dag.nodes() {
        if node.recursive {
            continue;
        }

        if node.facts.or_across_columns {
            push(
                "or_to_union",
                &node.id,
                "WHERE contains OR spanning different columns".to_string(),
            );
        }

        if node.is_correlated {
            if node.facts.has_aggregate {
                push(
                    "correlated_to_cte",
                    &node.id,
                    "correlated subquery computes a per-group aggregate".to_string(),
                );
            }
            push("flatten_subq", &node.id, "correlated subquery references outer scope".to_string());
        }

        let date_table = node.tables.iter().find(|t| t.to_lowercase().contains("date"));
        if let Some(date_table) = date_table {
            if !node.filters.is_empty() && node.facts.relation_count >= 2 {
                push(
                    "date_cte_isolate",
                    &node.id,
                    format!("date dimension {date_table} joined under a filter"),
                );
            }
        }

        if node.node_type == NodeType::MainQuery
            && !node.filters.is_empty()
            && !node.cte_refs.is_empty()
        {
            push("push_pred", &node.id, "filter applied above a CTE boundary".to_string());

            // A CTE chain means the filter may travel more than one layer
            let chained = node.cte_refs.iter().any(|r| {
                dag.get_node(r).map(|n| !n.cte_refs.is_empty()).unwrap_or(false)
            });
            if chained {
                push(
                    "multi_push_pred",
                    &node.id,
                    "filter sits above a chain of CTEs".to_string(),
                );
            }
        }

        if node.facts.has_distinct && node.facts.has_group_by {
            push(
                "remove_redundant",
                &node.id,
                "DISTINCT alongside GROUP BY is redundant".to_string(),
            );
        }

        if node.facts.relation_count >= 3 && !node.filters.is_empty() {
            push(
                "reorder_join",
                &node.id,
                format!("{}-relation join with filters", node.facts.relation_count),
            );
        }
    }

    // Repeated scans of one base table across scopes
    for (table, scopes) in &scans_by_table {
        if scopes.len() >= 2 {
            push(
                "consolidate_scans",
                scopes[0],
                format!("table {} scanned in {} scopes", table, scopes.len()),
            );
        }
    }

    // Repeated subquery bodies -> shared CTE
    let mut subquery_counts: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in dag.nodes() {
        if matches!(node.node_type, NodeType::Subquery | NodeType::DerivedTable) {
            subquery_counts.entry(node.sql.as_str()).or_default().push(&node.id);
        }
    }
    for scopes in subquery_counts.values() {
        if scopes.len() >= 2 {
            push(
                "materialize_cte",
                scopes[0],
                format!("identical subquery appears {} times", scopes.len()),
            );
        }
    }

    // Single-use CTEs are inlining candidates
    for node in dag.nodes() {
        if node.node_type == NodeType::Cte && !node.recursive {
            let dependents = dag.dependents(&node.id);
            if dependents.len() == 1 && !node.facts.has_aggregate {
                push("inline_cte", &node.id, "CTE referenced exactly once".to_string());
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(sql: &str) -> Vec<Opportunity> {
        let registry = TransformRegistry::with_builtins();
        let dag = SqlDag::from_sql(sql);
        detect_opportunities(&dag, &registry)
    }

    fn has(opps: &[Opportunity], id: &str) -> bool {
        opps.iter().any(|o| o.transform_id == id)
    }

    #[test]
    fn test_or_to_union_detected() {
        let opps = detect("SELECT * FROM t WHERE a = 1 OR b = 2");
        assert!(has(&opps, "or_to_union"));
    }

    #[test]
    fn test_or_same_column_not_detected() {
        let opps = detect("SELECT * FROM t WHERE a = 1 OR a = 2");
        assert!(!has(&opps, "or_to_union"));
    }

    #[test]
    fn test_correlated_aggregate_detected() {
        let opps = detect(
            "WITH totals AS (SELECT store_sk, SUM(fee) AS total FROM store_returns \
             GROUP BY store_sk) \
             SELECT * FROM totals t1 WHERE t1.total > \
             (SELECT AVG(t2.total) FROM totals t2 WHERE t1.store_sk = t2.store_sk)",
        );
        assert!(has(&opps, "correlated_to_cte"));
        assert!(has(&opps, "flatten_subq"));
    }

    #[test]
    fn test_date_cte_isolate_detected() {
        let opps = detect(
            "SELECT c.id, SUM(s.price) FROM store_sales s \
             JOIN date_dim d ON s.sold_date_sk = d.d_date_sk \
             JOIN customer c ON s.customer_sk = c.customer_sk \
             WHERE d.d_year = 2001 GROUP BY c.id",
        );
        assert!(has(&opps, "date_cte_isolate"));
        // 3 relations + filter also triggers join reordering
        assert!(has(&opps, "reorder_join"));
    }

    #[test]
    fn test_consolidate_scans_detected() {
        let opps = detect(
            "WITH am AS (SELECT site, SUM(price) AS v FROM web_sales WHERE hr < 12 GROUP BY site), \
                  pm AS (SELECT site, SUM(price) AS v FROM web_sales WHERE hr >= 12 GROUP BY site) \
             SELECT am.site FROM am JOIN pm ON am.site = pm.site",
        );
        assert!(has(&opps, "consolidate_scans"));
    }

    #[test]
    fn test_push_pred_detected() {
        let opps = detect(
            "WITH sales AS (SELECT customer_id, amount FROM orders) \
             SELECT * FROM sales WHERE customer_id = 100",
        );
        assert!(has(&opps, "push_pred"));
        assert!(has(&opps, "inline_cte"));
    }

    #[test]
    fn test_multi_push_pred_needs_cte_chain() {
        let chained = detect(
            "WITH l1 AS (SELECT customer_id, amount FROM orders), \
                  l2 AS (SELECT customer_id, SUM(amount) AS total FROM l1 GROUP BY customer_id) \
             SELECT * FROM l2 WHERE customer_id = 100",
        );
        assert!(has(&chained, "multi_push_pred"));

        let flat = detect(
            "WITH l1 AS (SELECT customer_id, amount FROM orders) \
             SELECT * FROM l1 WHERE customer_id = 100",
        );
        assert!(!has(&flat, "multi_push_pred"));
    }

    #[test]
    fn test_unparseable_yields_nothing() {
        assert!(detect("NOT SQL ((").is_empty());
    }

    #[test]
    fn test_disabled_transform_not_reported() {
        let registry = TransformRegistry::with_builtins();
        registry.disable("or_to_union");
        let dag = SqlDag::from_sql("SELECT * FROM t WHERE a = 1 OR b = 2");
        let opps = detect_opportunities(&dag, &registry);
        assert!(!has(&opps, "or_to_union"));
    }
}
