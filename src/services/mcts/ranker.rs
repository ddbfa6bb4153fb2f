//! LLM transform ranking
//!
//! When a node is stuck or the candidate list is wide, the completer can
//! triage better than static weights: it sees the query, the plan, and what
//! already failed. Every failure mode here falls back silently to
//! contextual priors.

use std::collections::HashMap;
use std::time::Duration;

use crate::services::llm::Completer;
use crate::services::registry::TransformRegistry;
use crate::services::rewriter::response::parse_json_response;

/// Per-transform attempt statistics shown to the ranker
#[derive(Debug, Clone, Default)]
pub struct AttemptSummary {
    pub total: usize,
    pub llm_failed: usize,
    pub validation_pass: usize,
    pub validation_fail: usize,
    pub avg_speedup: f64,
    pub max_speedup: f64,
}

/// Heuristic gate: rank when there are many candidates, or the node looks
/// stuck (many visits, low reward, and no child doing better).
pub fn should_use_llm_ranking(
    node_visit_count: u64,
    node_avg_reward: f64,
    num_candidates: usize,
    children_rewards: &[f64],
) -> bool {
    if num_candidates > 4 {
        return true;
    }
    if num_candidates <= 3 && node_avg_reward >= 0.2 {
        return false;
    }
    if node_visit_count >= 5 && node_avg_reward < 0.2 {
        if children_rewards.is_empty() {
            return true;
        }
        return children_rewards.iter().all(|&r| r < 0.2);
    }
    false
}

/// Rank candidate transforms via the completer.
///
/// Returns the ordered ranking (best first, missing candidates appended),
/// or None on any error or timeout.
pub async fn rank_transforms(
    completer: &dyn Completer,
    candidates: &[String],
    sql: &str,
    applied: &[String],
    registry: &TransformRegistry,
    plan_text: Option<&str>,
    attempts: &HashMap<String, AttemptSummary>,
    timeout: Duration,
) -> Option<Vec<String>> {
    if candidates.is_empty() {
        return None;
    }

    let prompt = build_ranking_prompt(candidates, sql, applied, registry, plan_text, attempts);

    let response = match tokio::time::timeout(timeout, completer.complete(&prompt, timeout)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::debug!("LLM ranking failed: {}", e);
            return None;
        },
        Err(_) => {
            tracing::debug!("LLM ranking timed out after {:?}", timeout);
            return None;
        },
    };

    parse_ranking_response(&response, candidates)
}

fn build_ranking_prompt(
    candidates: &[String],
    sql: &str,
    applied: &[String],
    registry: &TransformRegistry,
    plan_text: Option<&str>,
    attempts: &HashMap<String, AttemptSummary>,
) -> String {
    let mut kb_lines = Vec::new();
    for id in candidates {
        if let Some(t) = registry.get(id) {
            let evidence = if t.benchmark_queries.is_empty() {
                String::new()
            } else {
                format!(" (proven on {})", t.benchmark_queries.join(", "))
            };
            kb_lines.push(format!(
                "- `{}`: {}{}\n  Trigger: {}\n  Rewrite: {}",
                t.id, t.name, evidence, t.trigger, t.rewrite_hint
            ));
        } else {
            kb_lines.push(format!("- `{id}`"));
        }
    }

    let mut history_lines = Vec::new();
    for (id, s) in attempts {
        if s.total == 0 {
            continue;
        }
        let line = if s.llm_failed == s.total {
            format!("- `{}`: tried {}x, completer could not apply it", id, s.total)
        } else if s.validation_fail > 0 && s.validation_pass == 0 {
            format!("- `{}`: tried {}x, every attempt broke semantics", id, s.total)
        } else if s.avg_speedup > 0.0 && s.avg_speedup < 1.0 {
            format!("- `{}`: tried {}x, REGRESSION avg {:.2}x - AVOID", id, s.total, s.avg_speedup)
        } else if s.max_speedup > 1.1 {
            format!("- `{}`: tried {}x, best {:.2}x speedup - PROMISING", id, s.total, s.max_speedup)
        } else {
            format!("- `{}`: tried {}x, marginal", id, s.total)
        };
        history_lines.push(line);
    }
    let history = if history_lines.is_empty() {
        "No attempts yet - this is the first ranking call.".to_string()
    } else {
        history_lines.join("\n")
    };

    format!(
        "Rank these SQL transforms by likelihood of improving this query's performance.\n\n\
         ## Previous Attempts on This Query\n{history}\n\n\
         ## Available Transforms\n{kb}\n\n\
         ## Execution Plan\n```\n{plan}\n```\n\n\
         ## SQL Query\n```sql\n{sql}\n```\n\n\
         ## Already Applied in Current Path\n{applied}\n\n\
         Review the previous attempts first: avoid what failed or regressed. \
         Then rank only transforms whose pattern actually appears in the query.\n\n\
         Return ONLY valid JSON:\n\
         {{\"ranking\": [\"transform_id_1\", \"transform_id_2\"], \"reasoning\": \"brief\"}}",
        history = history,
        kb = kb_lines.join("\n\n"),
        plan = plan_text.unwrap_or("Not available"),
        sql = crate::utils::truncate_chars(sql, 3000),
        applied = if applied.is_empty() { "none".to_string() } else { applied.join(", ") },
    )
}

/// Parse the ranking, keeping only known candidates and appending any the
/// completer forgot.
fn parse_ranking_response(response: &str, candidates: &[String]) -> Option<Vec<String>> {
    let json = parse_json_response(response)?;
    let ranking = json.get("ranking")?.as_array()?;

    let candidate_set: std::collections::HashSet<&str> =
        candidates.iter().map(String::as_str).collect();

    let mut valid: Vec<String> = ranking
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|id| candidate_set.contains(id))
        .map(str::to_string)
        .collect();
    valid.dedup();

    if valid.is_empty() {
        return None;
    }

    for id in candidates {
        if !valid.contains(id) {
            valid.push(id.clone());
        }
    }
    Some(valid)
}
