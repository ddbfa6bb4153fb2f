//! SQL DAG - scope graph over a parsed query
//!
//! Parses SQL into a graph where nodes are query scopes (main query, CTEs,
//! subqueries, union branches) and edges are data dependencies. Rewrites are
//! expressed as node replacements, which keeps completer output small and
//! verifiable.
//!
//! Parse errors degrade to an empty DAG: the query is still attempted with
//! simpler prompts, it just produces no detected opportunities.

pub mod detect;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Cte, Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::utils::normalize_whitespace;

/// Scope kind of a DAG node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    MainQuery,
    Cte,
    Subquery,
    DerivedTable,
    UnionBranch,
    /// Virtual parent node when the main query is a set operation
    Union,
}

/// Structural facts captured per scope, consumed by opportunity detection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFacts {
    /// WHERE has an OR whose branches filter different columns
    pub or_across_columns: bool,
    pub has_aggregate: bool,
    pub has_group_by: bool,
    pub has_distinct: bool,
    /// Base tables + CTE refs joined in this scope
    pub relation_count: usize,
}

/// A node in the SQL DAG representing a query scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    /// Unique id: "main_query", CTE alias, "subquery_N", "derived_N",
    /// "main_query.union[i]"
    pub id: String,
    pub node_type: NodeType,
    /// Direct base-table references (CTE refs excluded)
    pub tables: Vec<String>,
    /// Referenced CTE names
    pub cte_refs: Vec<String>,
    /// Rendered SQL for this scope
    pub sql: String,
    pub parent_id: Option<String>,
    /// References columns from an outer scope
    pub is_correlated: bool,
    /// Part of a recursive WITH; rewriting is disabled on this scope
    pub recursive: bool,
    /// Output columns (first 10)
    pub columns_out: Vec<String>,
    /// WHERE/HAVING conditions, truncated
    pub filters: Vec<String>,
    #[serde(default)]
    pub facts: NodeFacts,
    /// Whitespace-normalized SQL used to relocate this scope on rewrite
    #[serde(skip)]
    sql_norm: String,
    /// FROM aliases visible in this scope, for correlation checks
    #[serde(skip)]
    aliases: Vec<String>,
}

/// Data-flow edge kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// CTE reference
    Ref,
    /// Correlation to an outer scope
    Correlated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagEdge {
    pub source: String,
    pub target: String,
    pub edge_type: EdgeType,
}

/// Directed graph representation of a SQL query
#[derive(Debug, Clone, Default)]
pub struct SqlDag {
    nodes: Vec<DagNode>,
    index: HashMap<String, usize>,
    pub edges: Vec<DagEdge>,
    pub original_sql: String,
    parsed: Option<Query>,
}

impl SqlDag {
    /// Build a DAG from a SQL string. Parse errors yield an empty DAG.
    pub fn from_sql(sql: &str) -> Self {
        let mut dag = Self { original_sql: sql.to_string(), ..Default::default() };

        let query = match parse_single_query(sql) {
            Some(q) => q,
            None => {
                tracing::debug!("DAG parse failed, returning empty DAG");
                return dag;
            },
        };

        let mut builder = DagBuilder::new(&query);
        builder.build();

        dag.nodes = builder.nodes;
        dag.edges = builder.edges;
        dag.index = dag.nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect();
        dag.parsed = Some(query);
        dag
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_node(&self, id: &str) -> Option<&DagNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in build (traversal) order
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.iter()
    }

    /// Ids of nodes this node depends on
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Ids of nodes that depend on this node
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.source == id)
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Node ids in topological order (dependencies first).
    ///
    /// Scopes reference each other by name, so the visited set doubles as
    /// cycle protection for malformed (recursive) references.
    pub fn topological_order(&self) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut result = Vec::new();

        fn visit(
            dag: &SqlDag,
            id: &str,
            visited: &mut HashSet<String>,
            result: &mut Vec<String>,
        ) {
            if !visited.insert(id.to_string()) {
                return;
            }
            for dep in dag.dependencies(id) {
                visit(dag, dep, visited, result);
            }
            result.push(id.to_string());
        }

        for node in &self.nodes {
            visit(self, &node.id, &mut visited, &mut result);
        }
        result
    }

    /// Format the DAG for completer prompt input
    pub fn to_prompt(&self, include_sql: bool) -> String {
        let mut lines = vec!["## Query DAG".to_string(), String::new(), "```".to_string()];
        lines.push("Nodes:".to_string());

        for id in self.topological_order() {
            let Some(node) = self.get_node(&id) else { continue };
            let mut parts = vec![format!("  [{}]", node.id), format!("type={:?}", node.node_type)];
            if !node.tables.is_empty() {
                parts.push(format!("tables={:?}", node.tables));
            }
            if !node.cte_refs.is_empty() {
                parts.push(format!("refs={:?}", node.cte_refs));
            }
            if node.is_correlated {
                parts.push("CORRELATED".to_string());
            }
            if node.recursive {
                parts.push("RECURSIVE".to_string());
            }
            lines.push(parts.join(" "));
        }

        lines.push(String::new());
        lines.push("Edges:".to_string());
        for edge in &self.edges {
            let label = match edge.edge_type {
                EdgeType::Ref => String::new(),
                EdgeType::Correlated => " (correlated)".to_string(),
            };
            lines.push(format!("  {} -> {}{}", edge.source, edge.target, label));
        }
        lines.push("```".to_string());

        if include_sql {
            lines.push(String::new());
            lines.push("## Node SQL".to_string());
            for id in self.topological_order() {
                let Some(node) = self.get_node(&id) else { continue };
                if node.sql.is_empty() {
                    continue;
                }
                lines.push(format!("### {}", node.id));
                lines.push("```sql".to_string());
                lines.push(node.sql.trim().to_string());
                lines.push("```".to_string());
            }
        }

        lines.join("\n")
    }

    /// Apply node-level rewrites and return the reassembled SQL.
    ///
    /// Unknown node ids, recursive scopes, and unparseable bodies are
    /// skipped; a fully-skipped rewrite set returns SQL equal to the
    /// original, which the applicator then reports as a no-op.
    pub fn apply_rewrites(&self, rewrites: &BTreeMap<String, String>) -> String {
        let Some(parsed) = &self.parsed else {
            return self.original_sql.clone();
        };
        let mut result = parsed.clone();

        for (node_id, new_sql) in rewrites {
            let Some(node) = self.get_node(node_id) else {
                tracing::warn!("Rewrite for unknown node '{}' dropped", node_id);
                continue;
            };
            if node.recursive {
                tracing::warn!("Rewrite for recursive scope '{}' dropped", node_id);
                continue;
            }
            let Some(replacement) = parse_single_query(new_sql) else {
                tracing::warn!("Rewrite body for '{}' failed to parse, dropped", node_id);
                continue;
            };

            match node.node_type {
                NodeType::Cte => {
                    if !replace_cte_body(&mut result, node_id, replacement) {
                        tracing::warn!("CTE '{}' not found during rewrite", node_id);
                    }
                },
                NodeType::MainQuery => {
                    result = replace_main_query(&result, replacement);
                },
                NodeType::Subquery | NodeType::DerivedTable => {
                    if !replace_matching_subquery(&mut result, &node.sql_norm, &replacement) {
                        tracing::warn!("Subquery '{}' not found during rewrite", node_id);
                    }
                },
                NodeType::UnionBranch => {
                    if let Some(idx) = union_branch_index(node_id) {
                        if !replace_union_branch(&mut result, idx, replacement) {
                            tracing::warn!("Union branch {} not found during rewrite", idx);
                        }
                    }
                },
                NodeType::Union => {
                    tracing::warn!("Rewrite for virtual union node '{}' dropped", node_id);
                },
            }
        }

        result.to_string()
    }
}

/// Parse SQL expecting exactly one SELECT/WITH statement
pub fn parse_single_query(sql: &str) -> Option<Query> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).ok()?;
    statements.into_iter().find_map(|s| match s {
        Statement::Query(q) => Some(*q),
        _ => None,
    })
}

fn union_branch_index(node_id: &str) -> Option<usize> {
    node_id.strip_prefix("main_query.union[")?.strip_suffix(']')?.parse().ok()
}

// ============================================================================
// DAG construction
// ============================================================================

struct DagBuilder<'a> {
    query: &'a Query,
    nodes: Vec<DagNode>,
    edges: Vec<DagEdge>,
    cte_names: HashSet<String>,
    subquery_counter: usize,
}

impl<'a> DagBuilder<'a> {
    fn new(query: &'a Query) -> Self {
        let cte_names = query
            .with
            .as_ref()
            .map(|w| w.cte_tables.iter().map(|c| c.alias.name.value.to_lowercase()).collect())
            .unwrap_or_default();
        Self { query, nodes: Vec::new(), edges: Vec::new(), cte_names, subquery_counter: 0 }
    }

    fn build(&mut self) {
        let query = self.query;
        let recursive = query.with.as_ref().map(|w| w.recursive).unwrap_or(false);

        // CTE scopes first, in declaration order
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let id = cte.alias.name.value.to_lowercase();
                self.add_query_scope(&id, NodeType::Cte, &cte.query, None, recursive);
            }
        }

        // Main scope: either a plain select or a set operation with branches
        if let SetExpr::SetOperation { .. } = query.body.as_ref() {
            let branches = collect_set_op_branches(&query.body);
            for (i, branch) in branches.iter().enumerate() {
                let id = format!("main_query.union[{i}]");
                let sql = branch.to_string();
                self.add_scope(&id, NodeType::UnionBranch, branch, sql, Some("main_query"), false);
            }

            let body_sql = query.body.to_string();
            self.push_node(DagNode {
                id: "main_query".to_string(),
                node_type: NodeType::Union,
                tables: Vec::new(),
                cte_refs: Vec::new(),
                sql_norm: normalize_whitespace(&body_sql),
                sql: body_sql,
                parent_id: None,
                is_correlated: false,
                recursive: false,
                columns_out: Vec::new(),
                filters: Vec::new(),
                facts: NodeFacts::default(),
                aliases: Vec::new(),
            });
        } else {
            let mut stripped = query.clone();
            stripped.with = None;
            let sql = stripped.to_string();
            self.add_scope("main_query", NodeType::MainQuery, &query.body, sql, None, false);
        }
    }

    fn add_query_scope(
        &mut self,
        id: &str,
        node_type: NodeType,
        query: &'a Query,
        parent_id: Option<&str>,
        recursive: bool,
    ) {
        let sql = query.to_string();
        self.add_scope(id, node_type, &query.body, sql, parent_id, recursive);
    }

    fn add_scope(
        &mut self,
        id: &str,
        node_type: NodeType,
        body: &'a SetExpr,
        sql: String,
        parent_id: Option<&str>,
        recursive: bool,
    ) {
        let select = first_select(body);

        let mut tables = Vec::new();
        let mut cte_refs = Vec::new();
        let mut own_aliases = HashSet::new();
        let mut columns_out = Vec::new();
        let mut filters = Vec::new();
        let mut facts = NodeFacts::default();

        if let Some(select) = select {
            for twj in &select.from {
                self.collect_relations(twj, &mut tables, &mut cte_refs, &mut own_aliases);
            }
            facts.relation_count = tables.len() + cte_refs.len();

            for item in select.projection.iter().take(10) {
                match item {
                    SelectItem::ExprWithAlias { alias, .. } => {
                        columns_out.push(alias.value.clone());
                    },
                    SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                        columns_out.push(ident.value.clone());
                    },
                    SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                        if let Some(last) = parts.last() {
                            columns_out.push(last.value.clone());
                        }
                    },
                    _ => {},
                }
            }

            if let Some(selection) = &select.selection {
                filters.push(crate::utils::truncate_chars(&selection.to_string(), 100));
                facts.or_across_columns = has_or_across_columns(selection);
            }
            if let Some(having) = &select.having {
                filters.push(crate::utils::truncate_chars(&having.to_string(), 100));
            }

            facts.has_distinct = select.distinct.is_some();
            facts.has_group_by = match &select.group_by {
                GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
                GroupByExpr::All(_) => true,
            };
            facts.has_aggregate = select_has_aggregate(select);
        }

        let is_correlated = match select {
            Some(select) if parent_id.is_some() => {
                scope_is_correlated(select, &own_aliases, self.parent_aliases(parent_id))
            },
            _ => false,
        };

        self.push_node(DagNode {
            id: id.to_string(),
            node_type,
            tables,
            cte_refs: cte_refs.clone(),
            sql_norm: normalize_whitespace(&sql),
            sql,
            parent_id: parent_id.map(str::to_string),
            is_correlated,
            recursive,
            columns_out,
            filters,
            facts,
            aliases: own_aliases.into_iter().collect(),
        });

        for cte_ref in &cte_refs {
            self.edges.push(DagEdge {
                source: cte_ref.clone(),
                target: id.to_string(),
                edge_type: EdgeType::Ref,
            });
        }
        if is_correlated {
            if let Some(parent) = parent_id {
                self.edges.push(DagEdge {
                    source: parent.to_string(),
                    target: id.to_string(),
                    edge_type: EdgeType::Correlated,
                });
            }
        }

        // Recurse into nested scopes: derived tables first, then expression
        // subqueries. The shared counter gives stable subquery_N / derived_N
        // ids in traversal order.
        if let Some(select) = select {
            for twj in &select.from {
                self.descend_table_factor(&twj.relation, id);
                for join in &twj.joins {
                    self.descend_table_factor(&join.relation, id);
                }
            }
            let mut subqueries: Vec<&'a Query> = Vec::new();
            for item in &select.projection {
                if let SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } = item
                {
                    collect_expr_subqueries(e, &mut subqueries);
                }
            }
            if let Some(selection) = &select.selection {
                collect_expr_subqueries(selection, &mut subqueries);
            }
            if let Some(having) = &select.having {
                collect_expr_subqueries(having, &mut subqueries);
            }
            for sub in subqueries {
                self.subquery_counter += 1;
                let sub_id = format!("subquery_{}", self.subquery_counter);
                self.add_query_scope(&sub_id, NodeType::Subquery, sub, Some(id), false);
            }
        }
    }

    fn descend_table_factor(&mut self, factor: &'a TableFactor, parent_id: &str) {
        match factor {
            TableFactor::Derived { subquery, .. } => {
                self.subquery_counter += 1;
                let id = format!("derived_{}", self.subquery_counter);
                self.add_query_scope(&id, NodeType::DerivedTable, subquery, Some(parent_id), false);
            },
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.descend_table_factor(&table_with_joins.relation, parent_id);
                for join in &table_with_joins.joins {
                    self.descend_table_factor(&join.relation, parent_id);
                }
            },
            _ => {},
        }
    }

    fn collect_relations(
        &self,
        twj: &TableWithJoins,
        tables: &mut Vec<String>,
        cte_refs: &mut Vec<String>,
        own_aliases: &mut HashSet<String>,
    ) {
        self.collect_factor(&twj.relation, tables, cte_refs, own_aliases);
        for join in &twj.joins {
            self.collect_factor(&join.relation, tables, cte_refs, own_aliases);
        }
    }

    fn collect_factor(
        &self,
        factor: &TableFactor,
        tables: &mut Vec<String>,
        cte_refs: &mut Vec<String>,
        own_aliases: &mut HashSet<String>,
    ) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table_name = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                if table_name.is_empty() {
                    return;
                }
                let lowered = table_name.to_lowercase();
                if let Some(alias) = alias {
                    own_aliases.insert(alias.name.value.to_lowercase());
                } else {
                    own_aliases.insert(lowered.clone());
                }
                if self.cte_names.contains(&lowered) {
                    if !cte_refs.contains(&lowered) {
                        cte_refs.push(lowered);
                    }
                } else if !tables.contains(&table_name) {
                    tables.push(table_name);
                }
            },
            TableFactor::Derived { alias, .. } => {
                if let Some(alias) = alias {
                    own_aliases.insert(alias.name.value.to_lowercase());
                }
            },
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.collect_factor(&table_with_joins.relation, tables, cte_refs, own_aliases);
                for join in &table_with_joins.joins {
                    self.collect_factor(&join.relation, tables, cte_refs, own_aliases);
                }
            },
            _ => {},
        }
    }

    fn parent_aliases(&self, parent_id: Option<&str>) -> HashSet<String> {
        let Some(parent_id) = parent_id else { return HashSet::new() };
        let Some(parent) = self.nodes.iter().find(|n| n.id == parent_id) else {
            return HashSet::new();
        };
        parent
            .aliases
            .iter()
            .chain(parent.tables.iter())
            .chain(parent.cte_refs.iter())
            .map(|t| t.to_lowercase())
            .collect()
    }

    fn push_node(&mut self, node: DagNode) {
        self.nodes.push(node);
    }
}

fn first_select(body: &SetExpr) -> Option<&Select> {
    match body {
        SetExpr::Select(select) => Some(select),
        SetExpr::Query(query) => first_select(&query.body),
        _ => None,
    }
}

/// Collect the leaf branches of a set operation, left to right
fn collect_set_op_branches(body: &SetExpr) -> Vec<&SetExpr> {
    let mut branches = Vec::new();
    fn collect<'a>(node: &'a SetExpr, out: &mut Vec<&'a SetExpr>) {
        match node {
            SetExpr::SetOperation { left, right, .. } => {
                collect(left, out);
                collect(right, out);
            },
            other => out.push(other),
        }
    }
    collect(body, &mut branches);
    branches
}

// ============================================================================
// Expression walking
// ============================================================================

/// Visit every sub-expression, including the root
fn walk_expr<'a>(expr: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    f(expr);
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        },
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr) => walk_expr(expr, f),
        Expr::Cast { expr, .. } => walk_expr(expr, f),
        Expr::Between { expr, low, high, .. } => {
            walk_expr(expr, f);
            walk_expr(low, f);
            walk_expr(high, f);
        },
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, f);
            for item in list {
                walk_expr(item, f);
            }
        },
        Expr::InSubquery { expr, .. } => walk_expr(expr, f),
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            walk_expr(expr, f);
            walk_expr(pattern, f);
        },
        Expr::Case { operand, conditions, results, else_result } => {
            if let Some(operand) = operand {
                walk_expr(operand, f);
            }
            for c in conditions {
                walk_expr(c, f);
            }
            for r in results {
                walk_expr(r, f);
            }
            if let Some(e) = else_result {
                walk_expr(e, f);
            }
        },
        _ => {},
    }
}

/// Direct subqueries of an expression (not descending into them)
fn collect_expr_subqueries<'a>(expr: &'a Expr, out: &mut Vec<&'a Query>) {
    walk_expr(expr, &mut |e| match e {
        Expr::Subquery(q) => out.push(q),
        Expr::Exists { subquery, .. } => out.push(subquery),
        Expr::InSubquery { subquery, .. } => out.push(subquery),
        _ => {},
    });
}

/// Column names (last identifier segment) referenced by an expression
fn expr_columns(expr: &Expr) -> HashSet<String> {
    let mut columns = HashSet::new();
    walk_expr(expr, &mut |e| match e {
        Expr::Identifier(ident) => {
            columns.insert(ident.value.to_lowercase());
        },
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last() {
                columns.insert(last.value.to_lowercase());
            }
        },
        _ => {},
    });
    columns
}

/// True when a WHERE clause contains an OR whose sides filter different
/// columns — the structural signature for OR-to-UNION decomposition.
fn has_or_across_columns(selection: &Expr) -> bool {
    let mut found = false;
    walk_expr(selection, &mut |e| {
        if let Expr::BinaryOp { left, op, right } = e {
            if matches!(op, sqlparser::ast::BinaryOperator::Or) {
                let lc = expr_columns(left);
                let rc = expr_columns(right);
                if !lc.is_empty() && !rc.is_empty() && lc != rc {
                    found = true;
                }
            }
        }
    });
    found
}

const AGGREGATES: [&str; 5] = ["sum", "avg", "count", "min", "max"];

fn expr_has_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    walk_expr(expr, &mut |e| {
        if let Expr::Function(func) = e {
            if let Some(name) = func.name.0.last() {
                if AGGREGATES.contains(&name.value.to_lowercase().as_str()) {
                    found = true;
                }
            }
        }
    });
    found
}

fn select_has_aggregate(select: &Select) -> bool {
    for item in &select.projection {
        if let SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } = item {
            if expr_has_aggregate(e) {
                return true;
            }
        }
    }
    select.having.as_ref().is_some_and(expr_has_aggregate)
}

/// A scope is correlated when it qualifies a column with an alias that only
/// exists in the parent scope.
fn scope_is_correlated(
    select: &Select,
    own_aliases: &HashSet<String>,
    parent_aliases: HashSet<String>,
) -> bool {
    if parent_aliases.is_empty() {
        return false;
    }
    let mut correlated = false;
    let mut check = |expr: &Expr| {
        walk_expr(expr, &mut |e| {
            if let Expr::CompoundIdentifier(parts) = e {
                if parts.len() >= 2 {
                    let qualifier = parts[0].value.to_lowercase();
                    if parent_aliases.contains(&qualifier) && !own_aliases.contains(&qualifier) {
                        correlated = true;
                    }
                }
            }
        });
    };
    if let Some(selection) = &select.selection {
        check(selection);
    }
    if let Some(having) = &select.having {
        check(having);
    }
    for item in &select.projection {
        if let SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } = item {
            check(e);
        }
    }
    correlated
}

// ============================================================================
// Rewrite application
// ============================================================================

fn replace_cte_body(query: &mut Query, cte_name: &str, replacement: Query) -> bool {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            if cte.alias.name.value.eq_ignore_ascii_case(cte_name) {
                cte.query = Box::new(replacement);
                return true;
            }
        }
    }
    false
}

/// Replace the main query while preserving the original WITH clause.
///
/// When the replacement carries its own WITH, the original CTEs are
/// prepended unless the replacement redefines them.
fn replace_main_query(original: &Query, mut replacement: Query) -> Query {
    let Some(original_with) = &original.with else {
        return replacement;
    };

    match &mut replacement.with {
        None => {
            replacement.with = Some(original_with.clone());
        },
        Some(new_with) => {
            let redefined: HashSet<String> = new_with
                .cte_tables
                .iter()
                .map(|c| c.alias.name.value.to_lowercase())
                .collect();
            let mut merged: Vec<Cte> = original_with
                .cte_tables
                .iter()
                .filter(|c| !redefined.contains(&c.alias.name.value.to_lowercase()))
                .cloned()
                .collect();
            merged.extend(new_with.cte_tables.drain(..));
            new_with.cte_tables = merged;
            new_with.recursive |= original_with.recursive;
        },
    }
    replacement
}

/// Replace the subquery whose normalized rendering matches `target_norm`.
fn replace_matching_subquery(query: &mut Query, target_norm: &str, replacement: &Query) -> bool {
    fn walk_set_expr(body: &mut SetExpr, target: &str, replacement: &Query) -> bool {
        match body {
            SetExpr::Select(select) => {
                for twj in &mut select.from {
                    if walk_table_factor(&mut twj.relation, target, replacement) {
                        return true;
                    }
                    for join in &mut twj.joins {
                        if walk_table_factor(&mut join.relation, target, replacement) {
                            return true;
                        }
                    }
                }
                let mut exprs: Vec<&mut Expr> = Vec::new();
                for item in &mut select.projection {
                    if let SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } =
                        item
                    {
                        exprs.push(e);
                    }
                }
                if let Some(selection) = &mut select.selection {
                    exprs.push(selection);
                }
                if let Some(having) = &mut select.having {
                    exprs.push(having);
                }
                for expr in exprs {
                    if walk_expr_mut(expr, target, replacement) {
                        return true;
                    }
                }
                false
            },
            SetExpr::Query(inner) => walk_query(inner, target, replacement),
            SetExpr::SetOperation { left, right, .. } => {
                walk_set_expr(left, target, replacement)
                    || walk_set_expr(right, target, replacement)
            },
            _ => false,
        }
    }

    fn walk_table_factor(factor: &mut TableFactor, target: &str, replacement: &Query) -> bool {
        match factor {
            TableFactor::Derived { subquery, .. } => {
                if normalize_whitespace(&subquery.to_string()) == target {
                    **subquery = replacement.clone();
                    return true;
                }
                walk_query(subquery, target, replacement)
            },
            TableFactor::NestedJoin { table_with_joins, .. } => {
                if walk_table_factor(&mut table_with_joins.relation, target, replacement) {
                    return true;
                }
                for join in &mut table_with_joins.joins {
                    if walk_table_factor(&mut join.relation, target, replacement) {
                        return true;
                    }
                }
                false
            },
            _ => false,
        }
    }

    fn walk_expr_mut(expr: &mut Expr, target: &str, replacement: &Query) -> bool {
        match expr {
            Expr::Subquery(q) | Expr::Exists { subquery: q, .. }
            | Expr::InSubquery { subquery: q, .. } => {
                if normalize_whitespace(&q.to_string()) == target {
                    **q = replacement.clone();
                    return true;
                }
                walk_query(q, target, replacement)
            },
            Expr::BinaryOp { left, right, .. } => {
                walk_expr_mut(left, target, replacement)
                    || walk_expr_mut(right, target, replacement)
            },
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr) => walk_expr_mut(expr, target, replacement),
            Expr::Between { expr, low, high, .. } => {
                walk_expr_mut(expr, target, replacement)
                    || walk_expr_mut(low, target, replacement)
                    || walk_expr_mut(high, target, replacement)
            },
            Expr::InList { expr, list, .. } => {
                if walk_expr_mut(expr, target, replacement) {
                    return true;
                }
                list.iter_mut().any(|e| walk_expr_mut(e, target, replacement))
            },
            Expr::Case { operand, conditions, results, else_result } => {
                if let Some(operand) = operand {
                    if walk_expr_mut(operand, target, replacement) {
                        return true;
                    }
                }
                if conditions.iter_mut().any(|e| walk_expr_mut(e, target, replacement)) {
                    return true;
                }
                if results.iter_mut().any(|e| walk_expr_mut(e, target, replacement)) {
                    return true;
                }
                else_result
                    .as_mut()
                    .is_some_and(|e| walk_expr_mut(e, target, replacement))
            },
            _ => false,
        }
    }

    fn walk_query(query: &mut Query, target: &str, replacement: &Query) -> bool {
        if let Some(with) = &mut query.with {
            for cte in &mut with.cte_tables {
                if walk_query(&mut cte.query, target, replacement) {
                    return true;
                }
            }
        }
        walk_set_expr(&mut query.body, target, replacement)
    }

    walk_query(query, target_norm, replacement)
}

/// Replace branch `idx` of the top-level set operation
fn replace_union_branch(query: &mut Query, idx: usize, replacement: Query) -> bool {
    fn leaves<'q>(node: &'q mut SetExpr, out: &mut Vec<&'q mut SetExpr>) {
        // Set operations nest left; recurse before testing the leaf kind
        if let SetExpr::SetOperation { left, right, .. } = node {
            leaves(left, out);
            leaves(right, out);
            return;
        }
        out.push(node);
    }

    let mut branch_slots = Vec::new();
    leaves(&mut query.body, &mut branch_slots);

    match branch_slots.into_iter().nth(idx) {
        Some(slot) => {
            *slot = if replacement.with.is_none() && replacement.order_by.is_none() {
                *replacement.body
            } else {
                SetExpr::Query(Box::new(replacement))
            };
            true
        },
        None => false,
    }
}
