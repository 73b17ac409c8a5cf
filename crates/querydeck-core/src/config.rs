//! Engine configuration
//!
//! Every section deserializes with `#[serde(default)]`, so a TOML file only
//! needs the keys it changes:
//!
//! ```toml
//! [cache]
//! max_size_bytes = 52428800
//!
//! [filter]
//! force_scalar = true
//! ```
//!
//! [`EngineConfig::from_env`] resolves, in priority order: `QUERYDECK_*`
//! environment variables, `config/querydeck.toml`, defaults.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_SIZE_BYTES;
use crate::error::{Error, Result};
use crate::filter::DEFAULT_PARALLEL_THRESHOLD_ROWS;
use crate::history::DEFAULT_MAX_ITEMS;

/// File name looked up inside the configuration directory
pub const CONFIG_FILE_NAME: &str = "querydeck.toml";

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the engine consults the cache at all
    pub enabled: bool,
    /// Byte budget
    pub max_size_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between polls in `wait`/`wait_async`
    pub poll_interval_ms: u64,
    /// Worker thread stack size; platform default when unset
    pub thread_stack_size_bytes: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5,
            thread_stack_size_bytes: None,
        }
    }
}

/// Row filter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Never use the AVX2 kernels
    pub force_scalar: bool,
    /// Row count above which scans run in parallel chunks
    pub parallel_threshold_rows: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            force_scalar: false,
            parallel_threshold_rows: DEFAULT_PARALLEL_THRESHOLD_ROWS,
        }
    }
}

/// Transaction command settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Statement that opens a transaction
    pub begin_command: String,
    /// Statement that commits
    pub commit_command: String,
    /// Statement that rolls back
    pub rollback_command: String,
    /// Initial auto-commit flag of new trackers
    pub auto_commit: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            begin_command: "BEGIN TRANSACTION".to_string(),
            commit_command: "COMMIT TRANSACTION".to_string(),
            rollback_command: "ROLLBACK TRANSACTION".to_string(),
            auto_commit: true,
        }
    }
}

/// Query history settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Whether completed tasks are recorded
    pub enabled: bool,
    /// Maximum non-favorite entries kept
    pub max_items: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items: DEFAULT_MAX_ITEMS,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Result cache
    pub cache: CacheConfig,
    /// Scheduler
    pub scheduler: SchedulerConfig,
    /// Row filter
    pub filter: FilterConfig,
    /// Transactions
    pub transaction: TransactionConfig,
    /// History
    pub history: HistoryConfig,
}

impl EngineConfig {
    /// Parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str::<Self>(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    /// Load `querydeck.toml` from `config_dir`
    ///
    /// Returns None if the file doesn't exist or can't be parsed.
    pub fn from_config_dir(config_dir: impl AsRef<Path>) -> Option<Self> {
        let config_path = config_dir.as_ref().join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            tracing::debug!("Engine config file not found: {:?}", config_path);
            return None;
        }

        match Self::from_file(&config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Failed to load engine config {:?}: {}", config_path, e);
                None
            }
        }
    }

    /// Environment variables > `config/querydeck.toml` > defaults
    ///
    /// `QUERYDECK_CONFIG_DIR` replaces the `config` directory.
    pub fn from_env() -> Self {
        let config_dir =
            std::env::var("QUERYDECK_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::from_config_dir(&config_dir)
            .unwrap_or_default()
            .with_env_overrides()
    }

    /// Apply `QUERYDECK_*` variables on top of `self`
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("QUERYDECK_CACHE_ENABLED", &mut self.cache.enabled);
        override_from_env("QUERYDECK_CACHE_MAX_SIZE_BYTES", &mut self.cache.max_size_bytes);
        override_from_env(
            "QUERYDECK_SCHEDULER_POLL_INTERVAL_MS",
            &mut self.scheduler.poll_interval_ms,
        );
        if let Ok(value) = std::env::var("QUERYDECK_SCHEDULER_THREAD_STACK_SIZE_BYTES") {
            match value.parse::<usize>() {
                Ok(size) => self.scheduler.thread_stack_size_bytes = Some(size),
                Err(e) => tracing::warn!(
                    "Ignoring QUERYDECK_SCHEDULER_THREAD_STACK_SIZE_BYTES={:?}: {}",
                    value,
                    e
                ),
            }
        }
        override_from_env("QUERYDECK_FILTER_FORCE_SCALAR", &mut self.filter.force_scalar);
        override_from_env(
            "QUERYDECK_FILTER_PARALLEL_THRESHOLD_ROWS",
            &mut self.filter.parallel_threshold_rows,
        );
        override_from_env(
            "QUERYDECK_TRANSACTION_BEGIN_COMMAND",
            &mut self.transaction.begin_command,
        );
        override_from_env(
            "QUERYDECK_TRANSACTION_COMMIT_COMMAND",
            &mut self.transaction.commit_command,
        );
        override_from_env(
            "QUERYDECK_TRANSACTION_ROLLBACK_COMMAND",
            &mut self.transaction.rollback_command,
        );
        override_from_env(
            "QUERYDECK_TRANSACTION_AUTO_COMMIT",
            &mut self.transaction.auto_commit,
        );
        override_from_env("QUERYDECK_HISTORY_ENABLED", &mut self.history.enabled);
        override_from_env("QUERYDECK_HISTORY_MAX_ITEMS", &mut self.history.max_items);
        self
    }

    /// Replace the cache section
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the cache byte budget
    pub fn with_cache_size(mut self, max_size_bytes: usize) -> Self {
        self.cache.max_size_bytes = max_size_bytes;
        self
    }

    /// Replace the scheduler section
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replace the filter section
    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }

    /// Replace the transaction section
    pub fn with_transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    /// Replace the history section
    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }
}

fn override_from_env<T>(name: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(e) => tracing::warn!("Ignoring {}={:?}: {}", name, value, e),
        }
    }
}
