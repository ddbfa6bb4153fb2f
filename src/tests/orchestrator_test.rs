//! Cohort-level orchestrator tests: leaderboard, knowledge, promotion,
//! resume idempotence, api-only mode

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::models::{AttemptStatus, GlobalKnowledge, GoldExample, Leaderboard};
use crate::services::orchestrator::Orchestrator;
use crate::services::registry::TransformRegistry;
use crate::utils::load_json;

use super::common::{MarkerRunner, ScriptedCompleter, rewrite_response};

struct Workspace {
    _dir: tempfile::TempDir,
    bench_dir: PathBuf,
    examples_root: PathBuf,
    models_dir: PathBuf,
}

fn workspace() -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let bench_dir = dir.path().join("benchmarks").join("tpcds");
    let queries = bench_dir.join("queries");
    std::fs::create_dir_all(&queries).unwrap();
    std::fs::write(queries.join("q1.sql"), "SELECT * FROM t WHERE a = 1 OR b = 2").unwrap();
    std::fs::write(queries.join("q2.sql"), "SELECT * FROM t WHERE a = 5").unwrap();

    Workspace {
        examples_root: dir.path().join("examples"),
        models_dir: dir.path().join("models"),
        bench_dir,
        _dir: dir,
    }
}

fn config(api_only: bool, resume: bool) -> Config {
    let mut config = Config::default();
    config.engine.kind = "duckdb".to_string();
    config.scheduler.bootstrap = true;
    config.scheduler.api_only = api_only;
    config.scheduler.resume = resume;
    config.scheduler.workers_per_query = 1;
    config
}

async fn run_cohort(
    ws: &Workspace,
    config: &Config,
    completer: &ScriptedCompleter,
    runner: Option<&MarkerRunner>,
    out_dir: &Path,
) -> Leaderboard {
    let registry = TransformRegistry::with_builtins();
    let orchestrator = Orchestrator::new(
        config,
        &registry,
        completer,
        runner.map(|r| r as &dyn crate::services::runner::QueryRunner),
        &ws.bench_dir,
        &ws.examples_root,
        &ws.models_dir,
    );
    orchestrator.run(&[], Some(out_dir.to_path_buf())).await.unwrap()
}

#[tokio::test]
async fn test_cohort_produces_sound_leaderboard() {
    let ws = workspace();
    let cfg = config(false, false);
    let completer = ScriptedCompleter::new(rewrite_response(
        "SELECT * FROM t WHERE fast_path = 1",
        "Changes: narrowed the scan",
    ));
    let runner = MarkerRunner::new("fast_path", 100.0, 40.0);
    let out = ws.bench_dir.join("runs").join("run_t1");

    let leaderboard = run_cohort(&ws, &cfg, &completer, Some(&runner), &out).await;

    assert_eq!(leaderboard.entries.len(), 2);
    assert_eq!(leaderboard.status_counts["WIN"], 2);
    // Leaderboard soundness: WIN/IMPROVED entries are actually faster
    for entry in &leaderboard.entries {
        if matches!(entry.status, AttemptStatus::Win | AttemptStatus::Improved) {
            assert!(entry.optimized_ms.unwrap() < entry.original_ms.unwrap());
        }
    }

    // Artifacts
    assert!(ws.bench_dir.join("leaderboard.json").exists());
    assert!(out.join("summary.json").exists());
    assert!(out.join("q1").join("result.json").exists());

    let summary: serde_json::Value = load_json(&out.join("summary.json")).unwrap();
    assert_eq!(summary["total"], 2);
    assert!(summary["api_calls"].as_u64().unwrap() >= 2);
    assert!(summary["estimated_cost_usd"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_knowledge_promotion_and_reindex() {
    let ws = workspace();
    let cfg = config(false, false);
    let completer = ScriptedCompleter::new(rewrite_response(
        "SELECT * FROM t WHERE fast_path = 1",
        "Changes: narrowed the scan",
    ));
    // 100 / 31 ~ 3.2x, clears the 2.0x promotion bar
    let runner = MarkerRunner::new("fast_path", 100.0, 31.0);
    let out = ws.bench_dir.join("runs").join("run_t1");

    run_cohort(&ws, &cfg, &completer, Some(&runner), &out).await;

    // Knowledge file written and populated
    let knowledge: GlobalKnowledge =
        load_json(&ws.bench_dir.join("knowledge").join("duckdb_tpcds.json")).unwrap();
    assert!(!knowledge.principles.is_empty());
    assert_eq!(knowledge.source_runs, vec!["run_t1"]);

    // Worker strategy maps to push_pred; its win gets promoted
    let example_path = ws.examples_root.join("duckdb").join("push_pred.json");
    assert!(example_path.exists(), "gold example written");
    let example: GoldExample = load_json(&example_path).unwrap();
    assert!(example.speedup_value() > 2.0);

    // Tag index rebuilt over the new example
    let tags: std::collections::BTreeMap<String, Vec<String>> =
        load_json(&ws.models_dir.join("similarity_tags.json")).unwrap();
    assert!(tags.contains_key("push_pred"));
    assert_eq!(tags.len(), 1);
}

#[tokio::test]
async fn test_resume_is_idempotent() {
    let ws = workspace();
    let completer = ScriptedCompleter::new(rewrite_response(
        "SELECT * FROM t WHERE fast_path = 1",
        "Changes: narrowed the scan",
    ));
    let runner = MarkerRunner::new("fast_path", 100.0, 40.0);
    let out = ws.bench_dir.join("runs").join("run_t1");

    let first = run_cohort(&ws, &config(false, false), &completer, Some(&runner), &out).await;
    let calls_after_first = completer.call_count();

    let second = run_cohort(&ws, &config(false, true), &completer, Some(&runner), &out).await;

    // No duplicate work, identical result set
    assert_eq!(completer.call_count(), calls_after_first);
    assert_eq!(first.entries.len(), second.entries.len());
    for (a, b) in first.entries.iter().zip(second.entries.iter()) {
        assert_eq!(a.query_id, b.query_id);
        assert_eq!(a.status, b.status);
        assert_eq!(a.speedup, b.speedup);
    }
}

#[tokio::test]
async fn test_api_only_cohort_is_unvalidated() {
    let ws = workspace();
    let cfg = config(true, false);
    let completer = ScriptedCompleter::new(rewrite_response(
        "SELECT * FROM t WHERE fast_path = 1",
        "Changes: narrowed the scan",
    ));
    let out = ws.bench_dir.join("runs").join("run_t1");

    let leaderboard = run_cohort(&ws, &cfg, &completer, None, &out).await;

    assert_eq!(leaderboard.status_counts["UNVALIDATED"], 2);
    for entry in &leaderboard.entries {
        assert_eq!(entry.status, AttemptStatus::Unvalidated);
        assert!(entry.speedup.is_none());
        assert!(entry.optimized_ms.is_none());
    }
    // No knowledge writes in api-only mode
    assert!(!ws.bench_dir.join("knowledge").exists());
}

#[tokio::test]
async fn test_bootstrap_gate_blocks_blind_runs() {
    let ws = workspace();
    let mut cfg = config(false, false);
    cfg.scheduler.bootstrap = false;
    let completer = ScriptedCompleter::new("irrelevant");
    let runner = MarkerRunner::new("fast_path", 100.0, 40.0);
    let registry = TransformRegistry::with_builtins();

    let orchestrator = Orchestrator::new(
        &cfg,
        &registry,
        &completer,
        Some(&runner as &dyn crate::services::runner::QueryRunner),
        &ws.bench_dir,
        &ws.examples_root,
        &ws.models_dir,
    );
    let err = orchestrator
        .run(&[], Some(ws.bench_dir.join("runs").join("r")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bootstrap"));
    assert_eq!(completer.call_count(), 0);
}

#[tokio::test]
async fn test_query_filter_prefix_match() {
    let ws = workspace();
    let cfg = config(false, false);
    let completer = ScriptedCompleter::new(rewrite_response(
        "SELECT * FROM t WHERE fast_path = 1",
        "Changes: narrowed the scan",
    ));
    let runner = MarkerRunner::new("fast_path", 100.0, 40.0);
    let registry = TransformRegistry::with_builtins();

    let orchestrator = Orchestrator::new(
        &cfg,
        &registry,
        &completer,
        Some(&runner as &dyn crate::services::runner::QueryRunner),
        &ws.bench_dir,
        &ws.examples_root,
        &ws.models_dir,
    );
    let leaderboard = orchestrator
        .run(&["q1".to_string()], Some(ws.bench_dir.join("runs").join("r")))
        .await
        .unwrap();
    assert_eq!(leaderboard.entries.len(), 1);
    assert_eq!(leaderboard.entries[0].query_id, "q1");
}
