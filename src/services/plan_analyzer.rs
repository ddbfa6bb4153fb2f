//! Plan analyzer - extract optimization signals from EXPLAIN ANALYZE
//!
//! Walks an engine-native JSON plan tree and emits the signals that matter
//! for rewriting: bottleneck operators, unfiltered scans, late joins, and
//! cardinality misestimates. Accepts both DuckDB-style plans
//! (operator_timing / operator_cardinality / children) and PostgreSQL-style
//! plans (Actual Total Time / Actual Rows / Plans).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sql_dag::{NodeType, SqlDag};

/// One operator with its share of total cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCost {
    pub operator: String,
    pub time_ms: f64,
    pub rows: u64,
    /// time_ms / total_time * 100
    pub cost_pct: f64,
}

/// A base-table scan from the execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableScan {
    pub table: String,
    /// Defaults to cardinality when the engine does not report scanned rows
    pub rows_scanned: u64,
    pub rows_out: u64,
    pub cost_pct: f64,
    pub has_filter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_expr: Option<String>,
}

impl TableScan {
    /// Rows out over rows scanned; 1.0 when nothing was scanned
    pub fn selectivity(&self) -> f64 {
        if self.rows_scanned == 0 {
            return 1.0;
        }
        self.rows_out as f64 / self.rows_scanned as f64
    }
}

/// A join operation from the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinInfo {
    pub join_type: String,
    pub left_table: String,
    pub right_table: String,
    pub left_rows: u64,
    pub right_rows: u64,
    pub output_rows: u64,
    pub cost_pct: f64,
    /// A tiny table joined against a huge input; pushing it earlier usually
    /// shrinks the aggregate below it
    pub is_late: bool,
}

/// An operator whose estimated cardinality was far off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Misestimate {
    pub operator: String,
    pub estimated: u64,
    pub actual: u64,
    pub ratio: f64,
}

/// Data flow for one CTE, from SQL parsing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CteFlow {
    pub name: String,
    pub input_tables: Vec<String>,
    pub has_aggregation: bool,
}

/// All signals extracted for optimization, immutable per query version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationContext {
    pub total_time_ms: f64,
    /// Sorted by cost descending
    pub operators: Vec<OperatorCost>,
    pub table_scans: Vec<TableScan>,
    pub joins: Vec<JoinInfo>,
    pub misestimates: Vec<Misestimate>,
    pub ctes: Vec<CteFlow>,
    pub main_query_tables: Vec<String>,
}

impl OptimizationContext {
    pub fn top_operators(&self, n: usize) -> &[OperatorCost] {
        &self.operators[..self.operators.len().min(n)]
    }

    pub fn large_scans(&self, min_rows: u64) -> Vec<&TableScan> {
        self.table_scans.iter().filter(|s| s.rows_scanned >= min_rows).collect()
    }

    pub fn late_joins(&self) -> Vec<&JoinInfo> {
        self.joins.iter().filter(|j| j.is_late).collect()
    }

    /// Render the plan section of an optimization prompt
    pub fn to_prompt_section(&self) -> String {
        let mut lines = vec!["## Plan".to_string(), String::new()];

        if !self.operators.is_empty() {
            lines.push("Operators by cost:".to_string());
            for op in self.top_operators(5) {
                lines.push(format!(
                    "- {}: {}% cost, {} rows",
                    op.operator, op.cost_pct, op.rows
                ));
            }
            lines.push(String::new());
        }

        if !self.table_scans.is_empty() {
            lines.push("Scans:".to_string());
            for scan in &self.table_scans {
                if scan.has_filter {
                    lines.push(format!(
                        "- {}: {} -> {} rows (FILTERED)",
                        scan.table, scan.rows_scanned, scan.rows_out
                    ));
                } else {
                    lines.push(format!("- {}: {} rows (NO FILTER)", scan.table, scan.rows_scanned));
                }
            }
            lines.push(String::new());
        }

        if !self.misestimates.is_empty() {
            lines.push("Misestimates:".to_string());
            for mis in &self.misestimates {
                lines.push(format!(
                    "- {}: est {} vs actual {} ({}x)",
                    mis.operator, mis.estimated, mis.actual, mis.ratio
                ));
            }
            lines.push(String::new());
        }

        if !self.ctes.is_empty() || !self.main_query_tables.is_empty() {
            lines.push("Data flow:".to_string());
            for cte in &self.ctes {
                let agg = if cte.has_aggregation { " -> GROUP BY" } else { "" };
                lines.push(format!("- CTE {}: {:?}{}", cte.name, cte.input_tables, agg));
            }
            if !self.main_query_tables.is_empty() {
                lines.push(format!("- Main query: {:?}", self.main_query_tables));
            }
        }

        lines.join("\n")
    }
}

/// Extract optimization signals from an EXPLAIN ANALYZE plan and the SQL
pub fn analyze_plan(plan: &Value, sql: &str) -> OptimizationContext {
    let mut ctx = OptimizationContext::default();

    let root = normalize_root(plan);
    if let Some(root) = root {
        extract_operators(root, &mut ctx);
        extract_table_scans(root, &mut ctx);
        extract_joins(root, &mut ctx);
        extract_misestimates(root, &mut ctx);
    }
    extract_data_flow(sql, &mut ctx);

    ctx
}

/// Unwrap engine-specific plan envelopes down to the operator tree root
fn normalize_root(plan: &Value) -> Option<&Value> {
    match plan {
        // PostgreSQL: [{"Plan": {...}}]
        Value::Array(items) => items.first().and_then(|v| v.get("Plan")),
        Value::Object(obj) => {
            if obj.contains_key("Plan") {
                obj.get("Plan")
            } else {
                Some(plan)
            }
        },
        _ => None,
    }
}

fn node_name(node: &Value) -> String {
    node.get("operator_name")
        .or_else(|| node.get("name"))
        .or_else(|| node.get("Node Type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn node_time_ms(node: &Value) -> f64 {
    if let Some(secs) = node.get("operator_timing").and_then(Value::as_f64) {
        return secs * 1000.0;
    }
    node.get("Actual Total Time").and_then(Value::as_f64).unwrap_or(0.0)
}

fn node_rows(node: &Value) -> u64 {
    node.get("operator_cardinality")
        .or_else(|| node.get("Actual Rows"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn node_children(node: &Value) -> &[Value] {
    node.get("children")
        .or_else(|| node.get("Plans"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn node_extra(node: &Value) -> Option<&Value> {
    node.get("extra_info").filter(|v| v.is_object())
}

fn node_table(node: &Value) -> Option<String> {
    if let Some(extra) = node_extra(node) {
        if let Some(table) = extra.get("Table").and_then(Value::as_str) {
            return Some(table.to_string());
        }
    }
    node.get("Relation Name").and_then(Value::as_str).map(str::to_string)
}

fn node_filter(node: &Value) -> Option<String> {
    if let Some(extra) = node_extra(node) {
        if let Some(f) = extra.get("Filters").and_then(Value::as_str) {
            return Some(f.to_string());
        }
    }
    node.get("Filter").and_then(Value::as_str).map(str::to_string)
}

fn node_estimated(node: &Value) -> Option<u64> {
    if let Some(extra) = node_extra(node) {
        if let Some(est) = extra.get("Estimated Cardinality") {
            return match est {
                Value::String(s) => s.trim_start_matches('~').parse().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            };
        }
    }
    node.get("Plan Rows").and_then(Value::as_u64)
}

fn extract_operators(root: &Value, ctx: &mut OptimizationContext) {
    let mut operators = Vec::new();
    let mut total_ms = 0.0;

    fn walk(node: &Value, operators: &mut Vec<OperatorCost>, total_ms: &mut f64) {
        let name = node_name(node);
        if !name.is_empty() && name != "EXPLAIN_ANALYZE" {
            let time_ms = node_time_ms(node);
            *total_ms += time_ms;
            operators.push(OperatorCost {
                operator: name,
                time_ms: round1(time_ms),
                rows: node_rows(node),
                cost_pct: 0.0,
            });
        }
        for child in node_children(node) {
            walk(child, operators, total_ms);
        }
    }
    walk(root, &mut operators, &mut total_ms);

    ctx.total_time_ms = round1(total_ms);
    for op in &mut operators {
        if total_ms > 0.0 {
            op.cost_pct = round1(op.time_ms / total_ms * 100.0);
        }
    }
    operators.sort_by(|a, b| b.cost_pct.partial_cmp(&a.cost_pct).unwrap_or(std::cmp::Ordering::Equal));
    ctx.operators = operators;
}

fn extract_table_scans(root: &Value, ctx: &mut OptimizationContext) {
    fn walk(node: &Value, ctx: &mut OptimizationContext) {
        let name = node_name(node);
        if name.to_uppercase().contains("SCAN") {
            let table = node_table(node)
                .unwrap_or_else(|| name.replace("SEQ_SCAN", "").trim().to_string());
            let rows_out = node_rows(node);
            let rows_scanned = node
                .get("operator_rows_scanned")
                .and_then(Value::as_u64)
                .filter(|&n| n > 0)
                .unwrap_or(rows_out);
            let filter_expr = node_filter(node);
            let time_ms = node_time_ms(node);
            let cost_pct = if ctx.total_time_ms > 0.0 {
                round1(time_ms / ctx.total_time_ms * 100.0)
            } else {
                0.0
            };

            ctx.table_scans.push(TableScan {
                table,
                rows_scanned,
                rows_out,
                cost_pct,
                has_filter: filter_expr.is_some(),
                filter_expr,
            });
        }
        for child in node_children(node) {
            walk(child, ctx);
        }
    }
    walk(root, ctx);
}

fn extract_joins(root: &Value, ctx: &mut OptimizationContext) {
    fn walk(node: &Value, ctx: &mut OptimizationContext) {
        let name = node_name(node);
        if name.to_uppercase().contains("JOIN") {
            let children = node_children(node);
            let (mut left_rows, mut right_rows) = (0, 0);
            let (mut left_table, mut right_table) = ("?".to_string(), "?".to_string());
            if children.len() >= 2 {
                left_rows = node_rows(&children[0]);
                right_rows = node_rows(&children[1]);
                if let Some(t) = node_table(&children[0]) {
                    left_table = t;
                }
                if let Some(t) = node_table(&children[1]) {
                    right_table = t;
                }
            }

            let time_ms = node_time_ms(node);
            let cost_pct = if ctx.total_time_ms > 0.0 {
                round1(time_ms / ctx.total_time_ms * 100.0)
            } else {
                0.0
            };

            let is_late = (right_rows < 1000 && left_rows > 100_000)
                || (left_rows < 1000 && right_rows > 100_000);

            ctx.joins.push(JoinInfo {
                join_type: name,
                left_table,
                right_table,
                left_rows,
                right_rows,
                output_rows: node_rows(node),
                cost_pct,
                is_late,
            });
        }
        for child in node_children(node) {
            walk(child, ctx);
        }
    }
    walk(root, ctx);
}

fn extract_misestimates(root: &Value, ctx: &mut OptimizationContext) {
    fn walk(node: &Value, ctx: &mut OptimizationContext) {
        if let Some(estimated) = node_estimated(node) {
            let actual = node_rows(node);
            // Small nodes misestimate constantly and harmlessly
            if estimated.max(actual) >= 1000 {
                let ratio = estimated.max(actual) as f64 / estimated.min(actual).max(1) as f64;
                if ratio >= 5.0 {
                    ctx.misestimates.push(Misestimate {
                        operator: node_name(node),
                        estimated,
                        actual,
                        ratio: round1(ratio),
                    });
                }
            }
        }
        for child in node_children(node) {
            walk(child, ctx);
        }
    }
    walk(root, ctx);
}

/// CTE structure from the SQL itself; the plan rarely names CTEs directly
fn extract_data_flow(sql: &str, ctx: &mut OptimizationContext) {
    let dag = SqlDag::from_sql(sql);
    for node in dag.nodes() {
        match node.node_type {
            NodeType::Cte => ctx.ctes.push(CteFlow {
                name: node.id.clone(),
                input_tables: node.tables.clone(),
                has_aggregation: node.facts.has_aggregate || node.facts.has_group_by,
            }),
            NodeType::MainQuery | NodeType::UnionBranch => {
                for table in &node.tables {
                    if !ctx.main_query_tables.contains(table) {
                        ctx.main_query_tables.push(table.clone());
                    }
                }
            },
            _ => {},
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
