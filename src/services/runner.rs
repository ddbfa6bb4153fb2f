//! Query runner - the DB engine behind validation and plan capture
//!
//! The optimizer only chooses rewrites; the engine executes them. Everything
//! downstream (validator, plan analyzer, wave scheduler) talks to this trait
//! so the target engine stays swappable.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Errors surfaced by the query engine
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("engine timeout after {0}ms")]
    Timeout(u64),

    #[error("engine rejected SQL: {0}")]
    Engine(String),

    #[error("engine connection failed: {0}")]
    Connection(String),
}

impl RunnerError {
    /// Infrastructure failures abort the query; engine rejections are
    /// ordinary candidate failures.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Execution statistics for one statement
#[derive(Debug, Clone, Copy)]
pub struct QueryStats {
    pub rows: u64,
    pub elapsed_ms: f64,
}

/// A target engine connection (DuckDB, PostgreSQL, Snowflake)
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Execute a query, returning row count and wall time
    async fn execute(&self, sql: &str, deadline: Duration) -> Result<QueryStats, RunnerError>;

    /// Order-insensitive checksum over a deterministic projection of every
    /// output column. Computed engine-side so large results never cross the
    /// wire; commutative aggregation makes it multiset equality.
    async fn checksum(&self, sql: &str, deadline: Duration) -> Result<i64, RunnerError>;

    /// EXPLAIN ANALYZE as an engine-native JSON plan tree
    async fn explain_analyze(&self, sql: &str) -> Result<serde_json::Value, RunnerError>;

    /// Apply session-level options (SET LOCAL style config variants)
    async fn set_session(&self, options: &[String]) -> Result<(), RunnerError>;
}

/// Reference runner for PostgreSQL via sqlx
pub struct PostgresRunner {
    pool: PgPool,
}

impl PostgresRunner {
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, RunnerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .map_err(|e| RunnerError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn run_with_deadline<F, T>(&self, deadline: Duration, fut: F) -> Result<T, RunnerError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(map_sqlx_error(e)),
            Err(_) => Err(RunnerError::Timeout(deadline.as_millis() as u64)),
        }
    }
}

fn map_sqlx_error(e: sqlx::Error) -> RunnerError {
    match &e {
        sqlx::Error::Database(db) => RunnerError::Engine(db.message().to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RunnerError::Connection(e.to_string())
        },
        _ => RunnerError::Engine(e.to_string()),
    }
}

#[async_trait]
impl QueryRunner for PostgresRunner {
    async fn execute(&self, sql: &str, deadline: Duration) -> Result<QueryStats, RunnerError> {
        let started = Instant::now();
        let rows = self.run_with_deadline(deadline, sqlx::query(sql).fetch_all(&self.pool)).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        tracing::debug!("Query returned {} rows in {:.1}ms", rows.len(), elapsed_ms);

        Ok(QueryStats { rows: rows.len() as u64, elapsed_ms })
    }

    async fn checksum(&self, sql: &str, deadline: Duration) -> Result<i64, RunnerError> {
        // Sum of per-row text hashes: commutative, so row order is irrelevant.
        let wrapped = format!(
            "SELECT COALESCE(SUM(hashtext(t::text)::bigint), 0) AS h \
             FROM ({}) t",
            sql.trim_end_matches(';')
        );
        let row = self
            .run_with_deadline(deadline, sqlx::query(&wrapped).fetch_one(&self.pool))
            .await?;
        row.try_get::<i64, _>("h").map_err(map_sqlx_error)
    }

    async fn explain_analyze(&self, sql: &str) -> Result<serde_json::Value, RunnerError> {
        let explain = format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", sql.trim_end_matches(';'));
        let deadline = Duration::from_secs(600);
        let row = self
            .run_with_deadline(deadline, sqlx::query(&explain).fetch_one(&self.pool))
            .await?;
        let value: serde_json::Value = row.try_get(0).map_err(map_sqlx_error)?;
        Ok(value)
    }

    async fn set_session(&self, options: &[String]) -> Result<(), RunnerError> {
        for option in options {
            self.run_with_deadline(
                Duration::from_secs(10),
                sqlx::query(option).execute(&self.pool),
            )
            .await?;
            tracing::debug!("Applied session option: {}", option);
        }
        Ok(())
    }
}
