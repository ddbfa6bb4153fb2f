//! Checkpoint, resume, and progress snapshots
//!
//! The checkpoint lists completed query ids; progress is a live snapshot
//! for dashboards. Both are written atomically so a crash mid-wave leaves
//! either the previous version or a complete new one, never a torn file.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::{AttemptStatus, QueryResult};
use crate::utils::{load_json, write_json_atomic};

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Checkpoint {
    pub completed: Vec<String>,
    pub last_updated: String,
}

pub fn write_checkpoint(path: &Path, completed: &BTreeSet<String>) -> std::io::Result<()> {
    write_json_atomic(
        path,
        &Checkpoint {
            completed: completed.iter().cloned().collect(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        },
    )
}

pub fn load_checkpoint(path: &Path) -> BTreeSet<String> {
    load_json::<Checkpoint>(path)
        .map(|cp| cp.completed.into_iter().collect())
        .unwrap_or_default()
}

/// Recover results from per-query result.json files on disk.
///
/// Resume unions these with the checkpoint; a query in either set is
/// skipped.
pub fn discover_results(out_dir: &Path, allowed: &BTreeSet<String>) -> Vec<QueryResult> {
    let mut recovered = Vec::new();
    let Ok(entries) = std::fs::read_dir(out_dir) else { return recovered };
    for entry in entries.flatten() {
        let qid = entry.file_name().to_string_lossy().to_string();
        if !allowed.contains(&qid) {
            continue;
        }
        let result_path = entry.path().join("result.json");
        if let Some(result) = load_json::<QueryResult>(&result_path) {
            recovered.push(result);
        }
    }
    recovered.sort_by(|a, b| a.query_id.cmp(&b.query_id));
    recovered
}

#[derive(Debug, Serialize)]
struct ProgressSnapshot {
    updated_at: String,
    total: usize,
    completed: usize,
    remaining: usize,
    status_counts: std::collections::BTreeMap<String, usize>,
    winners_so_far: Vec<serde_json::Value>,
    api_calls: u64,
}

/// Write the atomic progress snapshot for the run
pub fn write_progress(
    out_dir: &Path,
    total: usize,
    results: &[QueryResult],
    api_calls: u64,
) -> std::io::Result<()> {
    let mut status_counts = std::collections::BTreeMap::new();
    for status in
        [AttemptStatus::Win, AttemptStatus::Improved, AttemptStatus::Neutral, AttemptStatus::Regression, AttemptStatus::Error, AttemptStatus::Fail, AttemptStatus::Unvalidated]
    {
        status_counts.insert(status.as_str().to_string(), 0usize);
    }
    for result in results {
        *status_counts.entry(result.status.as_str().to_string()).or_insert(0) += 1;
    }

    let mut winners: Vec<&QueryResult> = results
        .iter()
        .filter(|r| r.speedup.map(|s| s > 1.0).unwrap_or(false))
        .collect();
    winners.sort_by(|a, b| {
        b.speedup
            .partial_cmp(&a.speedup)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let winners_so_far = winners
        .iter()
        .take(20)
        .map(|r| {
            serde_json::json!({
                "query_id": r.query_id,
                "status": r.status.as_str(),
                "speedup": r.speedup,
            })
        })
        .collect();

    write_json_atomic(
        &out_dir.join("progress.json"),
        &ProgressSnapshot {
            updated_at: chrono::Utc::now().to_rfc3339(),
            total,
            completed: results.len(),
            remaining: total.saturating_sub(results.len()),
            status_counts,
            winners_so_far,
            api_calls,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;

    fn result(qid: &str, status: AttemptStatus, speedup: Option<f64>) -> QueryResult {
        QueryResult {
            query_id: qid.to_string(),
            status,
            speedup,
            original_ms: speedup.map(|_| 100.0),
            optimized_ms: speedup.map(|s| 100.0 / s),
            original_sql: String::new(),
            optimized_sql: String::new(),
            provenance: Provenance::default(),
            error: None,
        }
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let completed: BTreeSet<String> =
            ["q1", "q2"].iter().map(|s| s.to_string()).collect();
        write_checkpoint(&path, &completed).unwrap();
        assert_eq!(load_checkpoint(&path), completed);

        // Missing or corrupt checkpoints are empty, never fatal
        assert!(load_checkpoint(&dir.path().join("missing.json")).is_empty());
        std::fs::write(&path, "{trunc").unwrap();
        assert!(load_checkpoint(&path).is_empty());
    }

    #[test]
    fn test_discover_results_respects_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        for qid in ["q1", "q2", "q_other"] {
            let result_dir = dir.path().join(qid);
            std::fs::create_dir_all(&result_dir).unwrap();
            write_json_atomic(
                &result_dir.join("result.json"),
                &result(qid, AttemptStatus::Win, Some(2.5)),
            )
            .unwrap();
        }

        let allowed: BTreeSet<String> =
            ["q1", "q2", "q3"].iter().map(|s| s.to_string()).collect();
        let recovered = discover_results(dir.path(), &allowed);
        let ids: Vec<&str> = recovered.iter().map(|r| r.query_id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2"]);
    }

    #[test]
    fn test_progress_counts_and_winners() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![
            result("q1", AttemptStatus::Win, Some(3.0)),
            result("q2", AttemptStatus::Neutral, Some(1.0)),
            result("q3", AttemptStatus::Error, None),
        ];
        write_progress(dir.path(), 10, &results, 42).unwrap();

        let progress: serde_json::Value = load_json(&dir.path().join("progress.json")).unwrap();
        assert_eq!(progress["total"], 10);
        assert_eq!(progress["completed"], 3);
        assert_eq!(progress["remaining"], 7);
        assert_eq!(progress["status_counts"]["WIN"], 1);
        assert_eq!(progress["status_counts"]["ERROR"], 1);
        assert_eq!(progress["winners_so_far"][0]["query_id"], "q1");
        assert_eq!(progress["api_calls"], 42);
    }
}
