use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub completer: CompleterConfig,
    pub search: SearchConfig,
    pub scheduler: SchedulerConfig,
    pub promotion: PromotionConfig,
    pub logging: LoggingConfig,
}

/// Target engine connection and benchmarking knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine kind: duckdb | postgres | snowflake
    pub kind: String,
    /// Connection DSN (e.g. postgres://user@host/db)
    pub dsn: String,
    /// Max concurrent DB executions
    pub db_slots: usize,
    /// Interleaved timing rounds per side (3 or 5)
    pub timing_rounds: usize,
    /// Per-statement execution deadline in milliseconds
    pub statement_timeout_ms: u64,
    /// SET LOCAL variants tried during config boost (empty = disabled)
    pub boost_variants: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: "duckdb".to_string(),
            dsn: String::new(),
            db_slots: 8,
            timing_rounds: 3,
            statement_timeout_ms: 120_000,
            boost_variants: Vec::new(),
        }
    }
}

/// Completer (LLM oracle) connection knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompleterConfig {
    pub api_base: String,
    pub model: String,
    /// Read from APP_COMPLETER_API_KEY when empty
    pub api_key: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_seconds: u64,
    /// Max concurrent completer calls
    pub api_slots: usize,
}

impl Default for CompleterConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: String::new(),
            max_tokens: 8192,
            temperature: 0.2,
            timeout_seconds: 120,
            api_slots: 32,
        }
    }
}

/// MCTS search knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_iterations: usize,
    pub target_speedup: f64,
    pub early_stop_speedup: f64,
    /// Iterations without best improvement before stopping
    pub convergence_patience: usize,
    pub c_puct: f64,
    pub max_depth: usize,
    pub use_puct: bool,
    pub use_opportunity_detection: bool,
    pub use_llm_ranking: bool,
    /// Deadline for ranking calls; fallback to contextual priors on expiry
    pub llm_timeout_ms: u64,
    /// Concurrent completer calls per parallel expansion
    pub num_parallel: usize,
    pub examples_per_prompt: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            target_speedup: 100.0,
            early_stop_speedup: 3.0,
            convergence_patience: 10,
            c_puct: 1.414,
            max_depth: 5,
            use_puct: true,
            use_opportunity_detection: true,
            use_llm_ranking: false,
            llm_timeout_ms: 5000,
            num_parallel: 4,
            examples_per_prompt: 3,
        }
    }
}

/// Wave pipeline knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pipeline: "wave" (worker proposals + snipe) or "mcts" (tree search)
    pub mode: String,
    /// Rewrite proposals per query in Wave 1
    pub workers_per_query: usize,
    pub resume: bool,
    /// Run API waves only; no benchmarking, results marked UNVALIDATED
    pub api_only: bool,
    /// Skip intelligence gates when no gold examples exist yet
    pub bootstrap: bool,
    /// Emit structured output contracts alongside results
    pub output_contract: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: "wave".to_string(),
            workers_per_query: 2,
            resume: false,
            api_only: false,
            bootstrap: false,
            output_contract: false,
        }
    }
}

/// Gold-example promotion knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Minimum verified speedup before a rewrite becomes a gold example
    pub min_speedup: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self { min_speedup: 2.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,sqlopt=debug".to_string(), file: Some("logs/sqlopt.log".to_string()) }
    }
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "sqlopt")]
#[command(version, about = "sqlopt - Adaptive SQL Query Optimizer")]
pub struct CommandLineArgs {
    /// Benchmark directory (queries + knowledge + runs)
    #[arg(value_name = "BENCHMARK")]
    pub benchmark: String,

    /// Query filter (repeatable, prefix match)
    #[arg(short = 'q', long = "query", value_name = "ID")]
    pub queries: Vec<String>,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Engine DSN (overrides config file)
    #[arg(long, value_name = "DSN")]
    pub dsn: Option<String>,

    /// Max concurrent DB executions (overrides config file)
    #[arg(long, value_name = "N")]
    pub db_slots: Option<usize>,

    /// Max concurrent completer calls (overrides config file)
    #[arg(long, value_name = "N")]
    pub api_slots: Option<usize>,

    /// Max MCTS iterations per query (overrides config file)
    #[arg(long, value_name = "N")]
    pub max_iterations: Option<usize>,

    /// Stop a query early at this speedup (overrides config file)
    #[arg(long, value_name = "X")]
    pub early_stop_speedup: Option<f64>,

    /// Resume from checkpoint and existing results
    #[arg(long)]
    pub resume: bool,

    /// Run API waves only, skip all benchmarking
    #[arg(long)]
    pub api_only: bool,

    /// First-run mode: skip intelligence gates when no gold examples exist
    #[arg(long)]
    pub bootstrap: bool,

    /// Pipeline mode: wave | mcts (overrides config file)
    #[arg(long, value_name = "MODE")]
    pub mode: Option<String>,

    /// Logging level (overrides config file, e.g. "info,sqlopt=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_ENGINE_DSN: Engine connection DSN
    /// - APP_ENGINE_KIND: Engine kind (duckdb | postgres | snowflake)
    /// - APP_DB_SLOTS: Max concurrent DB executions
    /// - APP_API_SLOTS: Max concurrent completer calls
    /// - APP_COMPLETER_API_BASE: Completer API base URL
    /// - APP_COMPLETER_API_KEY: Completer API key
    /// - APP_COMPLETER_MODEL: Completer model name
    /// - APP_LOG_LEVEL: Logging level
    fn apply_env_overrides(&mut self) {
        if let Ok(dsn) = std::env::var("APP_ENGINE_DSN") {
            self.engine.dsn = dsn;
            tracing::info!("Override engine.dsn from env");
        }

        if let Ok(kind) = std::env::var("APP_ENGINE_KIND") {
            self.engine.kind = kind;
            tracing::info!("Override engine.kind from env: {}", self.engine.kind);
        }

        if let Ok(slots) = std::env::var("APP_DB_SLOTS")
            && let Ok(slots) = slots.parse()
        {
            self.engine.db_slots = slots;
            tracing::info!("Override engine.db_slots from env: {}", self.engine.db_slots);
        }

        if let Ok(slots) = std::env::var("APP_API_SLOTS")
            && let Ok(slots) = slots.parse()
        {
            self.completer.api_slots = slots;
            tracing::info!("Override completer.api_slots from env: {}", self.completer.api_slots);
        }

        if let Ok(base) = std::env::var("APP_COMPLETER_API_BASE") {
            self.completer.api_base = base;
            tracing::info!("Override completer.api_base from env");
        }

        if let Ok(key) = std::env::var("APP_COMPLETER_API_KEY") {
            self.completer.api_key = key;
            tracing::info!("Override completer.api_key from env");
        }

        if let Ok(model) = std::env::var("APP_COMPLETER_MODEL") {
            self.completer.model = model;
            tracing::info!("Override completer.model from env: {}", self.completer.model);
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(dsn) = &args.dsn {
            self.engine.dsn = dsn.clone();
            tracing::info!("Override engine.dsn from CLI");
        }

        if let Some(slots) = args.db_slots {
            self.engine.db_slots = slots;
            tracing::info!("Override engine.db_slots from CLI: {}", self.engine.db_slots);
        }

        if let Some(slots) = args.api_slots {
            self.completer.api_slots = slots;
            tracing::info!("Override completer.api_slots from CLI: {}", self.completer.api_slots);
        }

        if let Some(n) = args.max_iterations {
            self.search.max_iterations = n;
            tracing::info!("Override search.max_iterations from CLI: {}", n);
        }

        if let Some(x) = args.early_stop_speedup {
            self.search.early_stop_speedup = x;
            tracing::info!("Override search.early_stop_speedup from CLI: {}", x);
        }

        if args.resume {
            self.scheduler.resume = true;
        }

        if args.api_only {
            self.scheduler.api_only = true;
        }

        if args.bootstrap {
            self.scheduler.bootstrap = true;
        }

        if let Some(mode) = &args.mode {
            self.scheduler.mode = mode.clone();
            tracing::info!("Override scheduler.mode from CLI: {}", self.scheduler.mode);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.engine.db_slots < 1 {
            anyhow::bail!("engine.db_slots must be >= 1");
        }
        if self.completer.api_slots < 1 {
            anyhow::bail!("completer.api_slots must be >= 1");
        }
        if !matches!(self.engine.timing_rounds, 3 | 5) {
            anyhow::bail!("engine.timing_rounds must be 3 or 5");
        }
        if self.search.max_depth == 0 {
            anyhow::bail!("search.max_depth must be >= 1");
        }
        if self.search.c_puct <= 0.0 {
            anyhow::bail!("search.c_puct must be > 0");
        }
        if self.promotion.min_speedup < 1.0 {
            anyhow::bail!("promotion.min_speedup must be >= 1.0");
        }
        if !matches!(self.scheduler.mode.as_str(), "wave" | "mcts") {
            anyhow::bail!("scheduler.mode must be \"wave\" or \"mcts\"");
        }
        if self.scheduler.api_only && self.scheduler.mode == "mcts" {
            anyhow::bail!("--api-only requires the wave pipeline (mcts validates every node)");
        }
        if !self.scheduler.api_only && self.engine.dsn.is_empty() {
            anyhow::bail!("engine.dsn is required unless running with --api-only");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
