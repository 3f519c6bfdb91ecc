// Configuration module for codegraph
// Reads from environment variables with sensible defaults

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    "__pycache__",
    ".git",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
    ".eggs",
    "*.egg-info",
    "venv",
    ".venv",
    "env",
    "build",
    "dist",
    ".nox",
];

pub const DEFAULT_SKIP_FILES: &[&str] = &["setup.py", "conftest.py", "noxfile.py"];

/// How the updater reconciles a changed unit with the stored graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Upsert new/changed entities, delete removed ones, leave the rest.
    #[default]
    FineGrained,
    /// Drop every stored entity of a changed unit and write all candidates.
    Recreate,
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fine-grained" | "fine_grained" | "fine" => Ok(UpdateStrategy::FineGrained),
            "recreate" => Ok(UpdateStrategy::Recreate),
            other => Err(format!("unknown update strategy `{other}`")),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Extraction worker threads (CODEGRAPH_WORKERS)
    pub workers: usize,

    /// Database connection pool size (CODEGRAPH_POOL_SIZE)
    pub pool_size: u32,

    /// Database connection pool minimum idle connections (CODEGRAPH_POOL_MIN_IDLE)
    pub pool_min_idle: u32,

    /// Concurrent enrichment calls (CODEGRAPH_ENRICH_CONCURRENCY)
    pub enrich_concurrency: usize,

    /// Enrichment requests per batch (CODEGRAPH_ENRICH_BATCH_SIZE)
    pub enrich_batch_size: usize,

    /// Per-call enrichment timeout in seconds (CODEGRAPH_ENRICH_TIMEOUT_SECS)
    pub enrich_timeout_secs: u64,

    /// Enrichment attempts per entity (CODEGRAPH_ENRICH_RETRIES)
    pub enrich_retries: usize,

    /// Store write attempts per entity (CODEGRAPH_STORE_RETRIES)
    pub store_retries: usize,

    /// CODEGRAPH_UPDATE_STRATEGY
    pub update_strategy: UpdateStrategy,

    /// Files above this size are skipped (CODEGRAPH_MAX_FILE_BYTES)
    pub max_file_bytes: u64,

    /// Extra excluded directory names, comma separated (CODEGRAPH_EXCLUDE)
    pub exclude: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pool_size: 10,
            pool_min_idle: 2,
            enrich_concurrency: 10,
            enrich_batch_size: 30,
            enrich_timeout_secs: 60,
            enrich_retries: 3,
            store_retries: 3,
            update_strategy: UpdateStrategy::FineGrained,
            max_file_bytes: 10 * 1024 * 1024,
            exclude: Vec::new(),
        }
    }
}

fn read_var<T>(name: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Debug,
{
    let Ok(val) = env::var(name) else {
        return;
    };
    match val.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(
            "invalid {} value: {}, using default: {:?}",
            name,
            val,
            slot
        ),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();

        read_var("CODEGRAPH_WORKERS", &mut config.workers);
        read_var("CODEGRAPH_POOL_SIZE", &mut config.pool_size);
        read_var("CODEGRAPH_POOL_MIN_IDLE", &mut config.pool_min_idle);
        read_var("CODEGRAPH_ENRICH_CONCURRENCY", &mut config.enrich_concurrency);
        read_var("CODEGRAPH_ENRICH_BATCH_SIZE", &mut config.enrich_batch_size);
        read_var("CODEGRAPH_ENRICH_TIMEOUT_SECS", &mut config.enrich_timeout_secs);
        read_var("CODEGRAPH_ENRICH_RETRIES", &mut config.enrich_retries);
        read_var("CODEGRAPH_STORE_RETRIES", &mut config.store_retries);
        read_var("CODEGRAPH_UPDATE_STRATEGY", &mut config.update_strategy);
        read_var("CODEGRAPH_MAX_FILE_BYTES", &mut config.max_file_bytes);

        if let Ok(val) = env::var("CODEGRAPH_EXCLUDE") {
            config.exclude = parse_list(&val);
        }

        config.workers = config.workers.max(1);
        config.enrich_concurrency = config.enrich_concurrency.max(1);
        config.enrich_batch_size = config.enrich_batch_size.max(1);
        config.enrich_retries = config.enrich_retries.max(1);
        config.store_retries = config.store_retries.max(1);
        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs.max(1))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
