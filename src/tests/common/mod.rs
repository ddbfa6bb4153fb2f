// Common test utilities and helpers

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::services::llm::{Completer, CompleterError};
use crate::services::runner::{QueryRunner, QueryStats, RunnerError};

/// Completer that always returns the same response and records prompts
pub struct ScriptedCompleter {
    response: String,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedCompleter {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into(), calls: Mutex::new(Vec::new()) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(&self, prompt: &str, _deadline: Duration) -> Result<String, CompleterError> {
        self.calls.lock().unwrap().push(prompt.to_string());
        Ok(self.response.clone())
    }
}

/// Completer that picks its response by a substring of the prompt.
///
/// Lets a test make exactly one transform succeed (the real completer only
/// manages a useful rewrite when the pattern actually applies).
pub struct RoutedCompleter {
    routes: Vec<(String, String)>,
    fallback: String,
    pub calls: Mutex<Vec<String>>,
}

impl RoutedCompleter {
    pub fn new(routes: Vec<(String, String)>, fallback: impl Into<String>) -> Self {
        Self { routes, fallback: fallback.into(), calls: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Completer for RoutedCompleter {
    async fn complete(&self, prompt: &str, _deadline: Duration) -> Result<String, CompleterError> {
        self.calls.lock().unwrap().push(prompt.to_string());
        for (needle, response) in &self.routes {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.fallback.clone())
    }
}

/// Engine where any SQL containing the marker runs at `fast_ms`, everything
/// else at `slow_ms`. Checksums are constant, so every rewrite is
/// "equivalent" unless the SQL contains `break_marker`.
pub struct MarkerRunner {
    pub marker: String,
    pub slow_ms: f64,
    pub fast_ms: f64,
    pub break_marker: Option<String>,
}

impl MarkerRunner {
    pub fn new(marker: impl Into<String>, slow_ms: f64, fast_ms: f64) -> Self {
        Self { marker: marker.into(), slow_ms, fast_ms, break_marker: None }
    }
}

#[async_trait]
impl QueryRunner for MarkerRunner {
    async fn execute(&self, sql: &str, _deadline: Duration) -> Result<QueryStats, RunnerError> {
        let elapsed_ms = if sql.contains(self.marker.as_str()) { self.fast_ms } else { self.slow_ms };
        Ok(QueryStats { rows: 100, elapsed_ms })
    }

    async fn checksum(&self, sql: &str, _deadline: Duration) -> Result<i64, RunnerError> {
        if let Some(bad) = &self.break_marker {
            if sql.contains(bad.as_str()) {
                return Ok(-1);
            }
        }
        Ok(0xBEEF)
    }

    async fn explain_analyze(&self, _sql: &str) -> Result<serde_json::Value, RunnerError> {
        Ok(serde_json::json!({
            "children": [{
                "operator_name": "SEQ_SCAN",
                "operator_timing": 0.1,
                "operator_cardinality": 100_000,
                "extra_info": {"Table": "t"},
                "children": []
            }]
        }))
    }

    async fn set_session(&self, _options: &[String]) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// A rewrites-shaped completer response replacing the main query
pub fn rewrite_response(new_main_query: &str, explanation: &str) -> String {
    serde_json::json!({
        "rewrites": {"main_query": new_main_query},
        "explanation": explanation,
    })
    .to_string()
}
