//! Structural SQL-diff transform inference
//!
//! Last-resort labeling for attempts whose transforms are not recorded
//! anywhere: compare the DAG shapes of original and optimized SQL and name
//! the transforms that explain the difference.

use std::collections::HashSet;

use crate::services::sql_dag::{NodeType, SqlDag};

#[derive(Debug, Default)]
struct Shape {
    cte_count: usize,
    union_branches: usize,
    correlated_scopes: usize,
    /// Lowercased base tables with scan multiplicity
    table_scans: Vec<String>,
    /// CTEs whose only input is a date-like dimension
    date_only_ctes: usize,
    main_has_filter: bool,
}

fn shape_of(sql: &str) -> Shape {
    let dag = SqlDag::from_sql(sql);
    let mut shape = Shape::default();

    for node in dag.nodes() {
        match node.node_type {
            NodeType::Cte => {
                shape.cte_count += 1;
                if !node.tables.is_empty()
                    && node.tables.iter().all(|t| t.to_lowercase().contains("date"))
                {
                    shape.date_only_ctes += 1;
                }
            },
            NodeType::UnionBranch => shape.union_branches += 1,
            NodeType::MainQuery => shape.main_has_filter = !node.filters.is_empty(),
            _ => {},
        }
        if node.is_correlated {
            shape.correlated_scopes += 1;
        }
        for table in &node.tables {
            shape.table_scans.push(table.to_lowercase());
        }
    }
    shape
}

fn max_scan_multiplicity(scans: &[String]) -> usize {
    let mut best = 0;
    let unique: HashSet<&String> = scans.iter().collect();
    for table in unique {
        best = best.max(scans.iter().filter(|t| *t == table).count());
    }
    best
}

/// Infer applied transforms from the structural difference between the
/// original and optimized SQL. Returns an empty list when the shapes are
/// indistinguishable.
pub fn infer_transforms_from_sql_diff(original: &str, optimized: &str) -> Vec<String> {
    let before = shape_of(original);
    let after = shape_of(optimized);
    let mut inferred = Vec::new();

    fn push(inferred: &mut Vec<String>, id: &str) {
        if !inferred.iter().any(|t| t == id) {
            inferred.push(id.to_string());
        }
    }

    if after.union_branches > before.union_branches {
        push(&mut inferred, "or_to_union");
    }

    if before.correlated_scopes > after.correlated_scopes {
        if after.cte_count > before.cte_count {
            push(&mut inferred, "correlated_to_cte");
        } else {
            push(&mut inferred, "flatten_subq");
        }
    }

    if after.date_only_ctes > before.date_only_ctes {
        push(&mut inferred, "date_cte_isolate");
    }

    let before_mult = max_scan_multiplicity(&before.table_scans);
    let after_mult = max_scan_multiplicity(&after.table_scans);
    if before_mult >= 2 && after_mult < before_mult {
        push(&mut inferred, "consolidate_scans");
    }

    if inferred.is_empty() {
        if after.cte_count > before.cte_count {
            push(&mut inferred, "materialize_cte");
        } else if after.cte_count < before.cte_count {
            push(&mut inferred, "inline_cte");
        } else if before.main_has_filter && !after.main_has_filter && after.cte_count > 0 {
            push(&mut inferred, "push_pred");
        }
    }

    inferred
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_to_union_inferred() {
        let t = infer_transforms_from_sql_diff(
            "SELECT * FROM t WHERE a = 1 OR b = 2",
            "SELECT * FROM t WHERE a = 1 UNION ALL SELECT * FROM t WHERE b = 2 AND a <> 1",
        );
        assert!(t.contains(&"or_to_union".to_string()));
    }

    #[test]
    fn test_correlated_to_cte_inferred() {
        let original = "WITH totals AS (SELECT store_sk, SUM(fee) AS total FROM r GROUP BY store_sk) \
             SELECT * FROM totals t1 WHERE t1.total > \
             (SELECT AVG(t2.total) FROM totals t2 WHERE t1.store_sk = t2.store_sk)";
        let optimized = "WITH totals AS (SELECT store_sk, SUM(fee) AS total FROM r GROUP BY store_sk), \
             store_avg AS (SELECT store_sk, AVG(total) AS threshold FROM totals GROUP BY store_sk) \
             SELECT t1.* FROM totals t1 JOIN store_avg sa ON t1.store_sk = sa.store_sk \
             WHERE t1.total > sa.threshold";
        let t = infer_transforms_from_sql_diff(original, optimized);
        assert!(t.contains(&"correlated_to_cte".to_string()));
    }

    #[test]
    fn test_date_cte_isolation_inferred() {
        let original = "SELECT c.id FROM sales s JOIN date_dim d ON s.dk = d.dk \
                        JOIN customer c ON s.ck = c.ck WHERE d.year = 2001";
        let optimized = "WITH dates AS (SELECT dk FROM date_dim WHERE year = 2001) \
                         SELECT c.id FROM sales s JOIN dates fd ON s.dk = fd.dk \
                         JOIN customer c ON s.ck = c.ck";
        let t = infer_transforms_from_sql_diff(original, optimized);
        assert!(t.contains(&"date_cte_isolate".to_string()));
    }

    #[test]
    fn test_consolidate_scans_inferred() {
        let original = "WITH am AS (SELECT site, SUM(v) AS s FROM web_sales WHERE h < 12 GROUP BY site), \
             pm AS (SELECT site, SUM(v) AS s FROM web_sales WHERE h >= 12 GROUP BY site) \
             SELECT am.site FROM am JOIN pm ON am.site = pm.site";
        let optimized = "SELECT site, SUM(CASE WHEN h < 12 THEN v END) AS am, \
             SUM(CASE WHEN h >= 12 THEN v END) AS pm FROM web_sales GROUP BY site";
        let t = infer_transforms_from_sql_diff(original, optimized);
        assert!(t.contains(&"consolidate_scans".to_string()));
    }

    #[test]
    fn test_identical_shapes_yield_nothing() {
        let sql = "SELECT a FROM t WHERE b = 1";
        assert!(infer_transforms_from_sql_diff(sql, "SELECT a FROM t WHERE b = 2").is_empty());
    }
}
