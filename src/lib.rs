//! sqlopt - adaptive, benchmark-driven SQL query optimizer
//!
//! Takes a database connection, a corpus of SQL queries, and a knowledge
//! base of rewrite patterns with verified speedups, and produces for each
//! query a semantically-equivalent rewrite that is measurably faster on the
//! target engine, plus a leaderboard, per-query provenance, and an
//! auto-extended library of verified rewrite patterns.
//!
//! The completer (LLM) and query engine are trait boundaries; everything
//! they return is treated as untrusted and validated before use.

pub mod config;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use models::{
    AttemptStatus, BlackboardEntry, GlobalKnowledge, GoldExample, Leaderboard, Opportunity,
    QueryResult, Transform, ValidationResult, ValidationStatus, WorkerAttempt,
};
pub use services::{
    Blackboard, Completer, HttpCompleter, Orchestrator, PostgresRunner, QueryRunner, Rewriter,
    SearchTree, SqlDag, SqlValidator, TagIndex, TransformRegistry, WaveScheduler,
};
