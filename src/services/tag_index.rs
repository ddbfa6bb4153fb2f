//! Tag index - deterministic example retrieval
//!
//! Every gold (and regression) example is tagged from its original SQL:
//! structural keywords plus referenced tables. Retrieval at prompt-build
//! time scores candidates by Jaccard overlap of tag sets; there is no model
//! behind this, so the index rebuilds cheaply and reproducibly after every
//! promotion.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::GoldExample;
use crate::utils::{load_json, write_json_atomic};

use super::sql_dag::SqlDag;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMetadata {
    built_at: String,
    example_count: usize,
}

/// Extract the deterministic tag set for a SQL string
pub fn extract_tags(sql: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let dag = SqlDag::from_sql(sql);

    for node in dag.nodes() {
        for table in &node.tables {
            tags.insert(format!("table:{}", table.to_lowercase()));
        }
        if node.facts.or_across_columns {
            tags.insert("kw:or_branch".to_string());
        }
        if node.facts.has_group_by {
            tags.insert("kw:group_by".to_string());
        }
        if node.facts.has_aggregate {
            tags.insert("kw:aggregate".to_string());
        }
        if node.facts.has_distinct {
            tags.insert("kw:distinct".to_string());
        }
        if node.is_correlated {
            tags.insert("kw:correlated".to_string());
        }
        match node.node_type {
            super::sql_dag::NodeType::Cte => {
                tags.insert("kw:cte".to_string());
            },
            super::sql_dag::NodeType::Subquery | super::sql_dag::NodeType::DerivedTable => {
                tags.insert("kw:subquery".to_string());
            },
            super::sql_dag::NodeType::Union | super::sql_dag::NodeType::UnionBranch => {
                tags.insert("kw:union".to_string());
            },
            _ => {},
        }
    }

    // Textual fallbacks that survive parse failures
    let lowered = sql.to_lowercase();
    if lowered.contains(" or ") {
        tags.insert("kw:or".to_string());
    }
    if lowered.contains("exists") {
        tags.insert("kw:exists".to_string());
    }
    if lowered.contains(" in (select") || lowered.contains(" in(select") {
        tags.insert("kw:in_subquery".to_string());
    }

    tags
}

/// Durable tag index over the example directory
pub struct TagIndex {
    examples_root: PathBuf,
    models_dir: PathBuf,
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl TagIndex {
    pub fn new(examples_root: impl Into<PathBuf>, models_dir: impl Into<PathBuf>) -> Self {
        Self { examples_root: examples_root.into(), models_dir: models_dir.into(), tags: BTreeMap::new() }
    }

    fn tags_path(&self) -> PathBuf {
        self.models_dir.join("similarity_tags.json")
    }

    fn metadata_path(&self) -> PathBuf {
        self.models_dir.join("similarity_metadata.json")
    }

    /// Load the persisted index; missing file yields an empty index
    pub fn load(&mut self) {
        self.tags = load_json(&self.tags_path()).unwrap_or_default();
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags_of(&self, example_id: &str) -> Option<&BTreeSet<String>> {
        self.tags.get(example_id)
    }

    /// Rebuild the index over every example file under the examples root.
    ///
    /// Each `examples/**/*.json` appears exactly once, keyed by example id.
    pub fn rebuild(&mut self) -> Result<usize, IndexError> {
        self.tags.clear();

        for example in load_all_examples(&self.examples_root) {
            let source =
                if example.original_sql.is_empty() { &example.example.input_slice } else { &example.original_sql };
            self.tags.insert(example.id.clone(), extract_tags(source));
        }

        write_json_atomic(&self.tags_path(), &self.tags)?;
        write_json_atomic(
            &self.metadata_path(),
            &IndexMetadata {
                built_at: chrono::Utc::now().to_rfc3339(),
                example_count: self.tags.len(),
            },
        )?;

        tracing::info!("Tag index rebuilt: {} examples", self.tags.len());
        Ok(self.tags.len())
    }

    /// Jaccard overlap between a query's tags and an example's tags
    pub fn score(&self, query_tags: &BTreeSet<String>, example_id: &str) -> f64 {
        let Some(example_tags) = self.tags.get(example_id) else { return 0.0 };
        jaccard(query_tags, example_tags)
    }

    /// Order examples for prompting: matched first (score desc, speedup
    /// tiebreak), then the remaining by score desc.
    pub fn rank_examples(&self, sql: &str, examples: &[GoldExample]) -> Vec<GoldExample> {
        let query_tags = extract_tags(sql);

        let mut scored: Vec<(f64, f64, GoldExample)> = examples
            .iter()
            .map(|e| (self.score(&query_tags, &e.id), e.speedup_value(), e.clone()))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        scored.into_iter().map(|(_, _, e)| e).collect()
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Load every example JSON under the root (recursing one engine level)
pub fn load_all_examples(root: &Path) -> Vec<GoldExample> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else { return out };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(load_all_examples(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Some(example) = load_json::<GoldExample>(&path) {
                out.push(example);
            }
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Rotating example window for retry-on-failure.
///
/// Shows `per_prompt` examples at a time; each rotation advances the
/// cursor, never re-showing a failed example until all are exhausted.
pub struct ExampleSelector {
    examples: Vec<GoldExample>,
    cursor: usize,
    per_prompt: usize,
}

impl ExampleSelector {
    pub fn new(sql: &str, index: &TagIndex, all_examples: &[GoldExample], per_prompt: usize) -> Self {
        Self {
            examples: index.rank_examples(sql, all_examples),
            cursor: 0,
            per_prompt: per_prompt.max(1),
        }
    }

    pub fn current(&self) -> &[GoldExample] {
        if self.cursor >= self.examples.len() {
            return &[];
        }
        let end = (self.cursor + self.per_prompt).min(self.examples.len());
        &self.examples[self.cursor..end]
    }

    pub fn remaining(&self) -> usize {
        self.examples.len().saturating_sub(self.cursor)
    }

    /// Advance past the current window after a failure. Returns false when
    /// every example has been tried.
    pub fn rotate(&mut self) -> bool {
        self.cursor += self.per_prompt;
        if self.cursor >= self.examples.len() {
            tracing::debug!("All {} examples exhausted", self.examples.len());
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExampleBody, ExampleClass, ExampleOutput};

    fn example(id: &str, sql: &str, speedup: &str) -> GoldExample {
        GoldExample {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            benchmark_queries: vec![],
            verified_speedup: speedup.to_string(),
            example: ExampleBody {
                opportunity: String::new(),
                input_slice: String::new(),
                output: ExampleOutput::default(),
                key_insight: String::new(),
                when_not_to_use: String::new(),
            },
            example_class: ExampleClass::Standard,
            original_sql: sql.to_string(),
            optimized_sql: String::new(),
        }
    }

    #[test]
    fn test_extract_tags_structural() {
        let tags = extract_tags(
            "WITH c AS (SELECT site, SUM(v) AS t FROM web_sales GROUP BY site) \
             SELECT * FROM c WHERE site = 1 OR t = 2",
        );
        assert!(tags.contains("table:web_sales"));
        assert!(tags.contains("kw:cte"));
        assert!(tags.contains("kw:group_by"));
        assert!(tags.contains("kw:aggregate"));
        assert!(tags.contains("kw:or_branch"));
    }

    #[test]
    fn test_tags_survive_parse_failure() {
        let tags = extract_tags("SELECT broken ( WHERE x EXISTS");
        assert!(tags.contains("kw:exists"));
    }

    #[test]
    fn test_rebuild_covers_every_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine_dir = dir.path().join("examples").join("duckdb");
        std::fs::create_dir_all(&engine_dir).unwrap();

        for (id, sql) in [
            ("or_to_union", "SELECT * FROM t WHERE a = 1 OR b = 2"),
            ("date_cte_isolate", "SELECT * FROM f JOIN date_dim d ON f.k = d.k WHERE d.y = 2001"),
        ] {
            write_json_atomic(
                &engine_dir.join(format!("{id}.json")),
                &example(id, sql, "2.50x"),
            )
            .unwrap();
        }

        let models = dir.path().join("models");
        let mut index = TagIndex::new(dir.path().join("examples"), &models);
        let count = index.rebuild().unwrap();
        assert_eq!(count, 2);

        let persisted: BTreeMap<String, BTreeSet<String>> =
            load_json(&models.join("similarity_tags.json")).unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(persisted.contains_key("or_to_union"));

        // Rebuild is idempotent, no duplicates
        let count2 = index.rebuild().unwrap();
        assert_eq!(count2, 2);
    }

    #[test]
    fn test_ranking_matched_first_speedup_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        let mut index = TagIndex::new(dir.path().join("examples"), &models);
        index.tags.insert("or_low".to_string(), extract_tags("SELECT * FROM t WHERE a = 1 OR b = 2"));
        index.tags.insert("or_high".to_string(), extract_tags("SELECT * FROM t WHERE a = 1 OR b = 2"));
        index.tags.insert("unrelated".to_string(), extract_tags("SELECT x FROM completely_other"));

        let examples = vec![
            example("unrelated", "SELECT x FROM completely_other", "9.99x"),
            example("or_low", "SELECT * FROM t WHERE a = 1 OR b = 2", "1.50x"),
            example("or_high", "SELECT * FROM t WHERE a = 1 OR b = 2", "2.98x"),
        ];

        let ranked = index.rank_examples("SELECT * FROM t WHERE a = 1 OR b = 2", &examples);
        let ids: Vec<&str> = ranked.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["or_high", "or_low", "unrelated"]);
    }

    #[test]
    fn test_selector_rotation_never_reshows() {
        let dir = tempfile::tempdir().unwrap();
        let index = TagIndex::new(dir.path().join("examples"), dir.path().join("models"));
        let examples: Vec<GoldExample> =
            (0..5).map(|i| example(&format!("e{i}"), "SELECT 1", "2.00x")).collect();

        let mut selector = ExampleSelector::new("SELECT 1", &index, &examples, 2);
        let first: Vec<String> = selector.current().iter().map(|e| e.id.clone()).collect();
        assert_eq!(first.len(), 2);

        assert!(selector.rotate());
        let second: Vec<String> = selector.current().iter().map(|e| e.id.clone()).collect();
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|id| !second.contains(id)));

        assert!(selector.rotate());
        assert_eq!(selector.current().len(), 1);
        assert!(!selector.rotate());
        assert_eq!(selector.current().len(), 0);
    }
}
