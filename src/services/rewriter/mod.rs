//! Rewriter applicator - one focused transform per call
//!
//! Contract: `apply` builds a focused prompt, calls the completer, parses
//! structured output (DAG rewrites or patches), and reassembles the SQL.
//! The applicator never executes SQL; it only transforms text. Unknown node
//! ids and malformed bodies drop the rewrite, they never crash.

pub mod patches;
pub mod prompts;
pub mod response;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::GoldExample;
use crate::services::llm::{Completer, CompleterError};
use crate::services::plan_analyzer::OptimizationContext;
use crate::services::registry::TransformRegistry;
use crate::services::sql_dag::{SqlDag, parse_single_query};
use crate::utils::normalize_whitespace;

use patches::{SqlPatch, apply_patches};
use response::{extract_sql, parse_json_response};

/// Retries after the first attempt, for parse failures and retryable
/// completer errors
const MAX_RETRIES: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("unknown transformation: {0}")]
    UnknownTransform(String),

    #[error(transparent)]
    Completer(#[from] CompleterError),

    #[error("rewrite produced no change (no-op)")]
    NoOp,

    #[error("could not extract a usable rewrite: {0}")]
    Unusable(String),
}

/// A successfully applied rewrite
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub sql: String,
    pub explanation: String,
    pub examples_used: Vec<String>,
}

/// Applies one transform to one query via the completer
pub struct Rewriter<'a> {
    registry: &'a TransformRegistry,
}

impl<'a> Rewriter<'a> {
    pub fn new(registry: &'a TransformRegistry) -> Self {
        Self { registry }
    }

    /// Apply `transform_id` to `sql`.
    ///
    /// Retries up to [`MAX_RETRIES`] times on unparseable responses and
    /// retryable completer errors, then surfaces the failure to the search
    /// loop (never further up).
    pub async fn apply(
        &self,
        sql: &str,
        transform_id: &str,
        completer: &dyn Completer,
        examples: &[GoldExample],
        plan: Option<&OptimizationContext>,
        deadline: Duration,
    ) -> Result<RewriteOutcome, RewriteError> {
        let transform = self
            .registry
            .get(transform_id)
            .filter(|t| t.enabled)
            .ok_or_else(|| RewriteError::UnknownTransform(transform_id.to_string()))?;

        let dag = SqlDag::from_sql(sql);
        let prompt = prompts::build_rewrite_prompt(&transform, sql, &dag, examples, plan);
        let examples_used: Vec<String> = examples.iter().map(|e| e.id.clone()).collect();

        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            let response = match completer.complete(&prompt, deadline).await {
                Ok(text) => text,
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    tracing::debug!("Completer error on attempt {}: {}, retrying", attempt + 1, e);
                    last_error = e.to_string();
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            match assemble_response(sql, &dag, &response) {
                Ok((new_sql, explanation)) => {
                    if normalize_whitespace(&new_sql) == normalize_whitespace(sql) {
                        return Err(RewriteError::NoOp);
                    }
                    return Ok(RewriteOutcome { sql: new_sql, explanation, examples_used });
                },
                Err(reason) => {
                    tracing::debug!(
                        "Unusable response on attempt {} for {}: {}",
                        attempt + 1,
                        transform_id,
                        reason
                    );
                    last_error = reason;
                },
            }
        }

        Err(RewriteError::Unusable(last_error))
    }
}

/// Turn a completer response into SQL, via DAG rewrites, patches, or a bare
/// SQL fallback. Returns (sql, explanation); errors trigger a retry in the
/// applicator and count as a failed proposal in the wave pipeline.
pub fn assemble_response(
    sql: &str,
    dag: &SqlDag,
    response: &str,
) -> Result<(String, String), String> {
    if let Some(json) = parse_json_response(response) {
        let explanation = json
            .get("explanation")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if let Some(rewrites) = json.get("rewrites").and_then(|v| v.as_object()) {
            if rewrites.is_empty() {
                return Err("empty rewrites object".to_string());
            }
            let map: BTreeMap<String, String> = rewrites
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            if map.is_empty() {
                return Err("rewrites held no string bodies".to_string());
            }
            return Ok((dag.apply_rewrites(&map), explanation));
        }

        if let Some(patch_list) = json.get("patches").and_then(|v| v.as_array()) {
            let patches: Vec<SqlPatch> = patch_list
                .iter()
                .filter_map(|p| serde_json::from_value(p.clone()).ok())
                .collect();
            if patches.is_empty() {
                return Err("empty patches array".to_string());
            }
            let outcome = apply_patches(sql, patches);
            if outcome.applied.is_empty() {
                return Err(format!("all {} patches failed to match", outcome.failed.len()));
            }
            if parse_single_query(&outcome.sql).is_none() {
                return Err("patched SQL does not parse".to_string());
            }
            return Ok((outcome.sql, explanation));
        }
    }

    // Bare-SQL fallback for completers that ignore the JSON contract
    match extract_sql(response) {
        Some(candidate) if parse_single_query(&candidate).is_some() => {
            Ok((candidate, String::new()))
        },
        Some(_) => Err("extracted SQL does not parse".to_string()),
        None => Err("no JSON and no SQL found in response".to_string()),
    }
}
