use std::sync::atomic::Ordering;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlopt::config::{CommandLineArgs, Config};
use sqlopt::services::{HttpCompleter, Orchestrator, PostgresRunner, QueryRunner, TransformRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = CommandLineArgs::parse();
    let config = Config::load(&args)?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);

    let registry = tracing_subscriber::registry().with(log_filter);

    // Keep the appender guard alive for the whole run
    let mut _log_guard = None;
    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sqlopt.log");

        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _log_guard = Some(guard);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("sqlopt starting up");
    tracing::info!("Configuration loaded successfully");

    let transform_registry = TransformRegistry::with_builtins();
    tracing::info!("Transform registry: {} transforms", transform_registry.all().len());

    let completer = HttpCompleter::new(config.completer.clone())?;

    // The engine connection is fatal at startup; everything later degrades
    let runner: Option<Box<dyn QueryRunner>> = if config.scheduler.api_only {
        tracing::info!("api-only mode: no engine connection");
        None
    } else {
        match config.engine.kind.as_str() {
            "postgres" => {
                let runner = PostgresRunner::connect(
                    &config.engine.dsn,
                    config.engine.db_slots as u32,
                )
                .await?;
                tracing::info!("Connected to PostgreSQL engine");
                Some(Box::new(runner))
            },
            other => {
                return Err(format!(
                    "no built-in runner for engine '{other}'; use engine.kind = \"postgres\" \
                     or run with --api-only"
                )
                .into());
            },
        }
    };

    let bench_dir = std::path::PathBuf::from("benchmarks").join(&args.benchmark);
    if !bench_dir.is_dir() {
        return Err(format!("benchmark directory not found: {}", bench_dir.display()).into());
    }

    let orchestrator = Orchestrator::new(
        &config,
        &transform_registry,
        &completer,
        runner.as_deref(),
        &bench_dir,
        "examples",
        "models",
    );

    // Ctrl-C requests a graceful abort: checkpoints flush, resume picks up
    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight steps");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let leaderboard = orchestrator.run(&args.queries, None).await?;

    let wins = leaderboard.status_counts.get("WIN").copied().unwrap_or(0);
    let improved = leaderboard.status_counts.get("IMPROVED").copied().unwrap_or(0);
    tracing::info!(
        "Leaderboard: {} queries, {} WIN, {} IMPROVED",
        leaderboard.entries.len(),
        wins,
        improved
    );

    Ok(())
}
