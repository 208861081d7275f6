//! Scheduler configuration
//!
//! Budgets:
//!   concurrency → table_concurrency (÷100, min 1) → per-depth semaphores (halving per level)
//!               → resource_concurrency (table_concurrency × 100)

use crate::error::{Result, SyncError};
use crate::scheduler::Strategy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct SchedulerConfig {
    /// Walk strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Global concurrency budget
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1))]
    pub concurrency: u64,

    /// Maximum table nesting depth
    #[serde(default = "default_max_depth")]
    #[validate(range(min = 1, max = 64))]
    pub max_depth: usize,

    /// Concurrent resources per (table, client) pair
    #[serde(default)]
    #[validate(range(min = 1))]
    pub single_resource_max_concurrency: Option<u64>,

    /// Concurrent child-table invocations per (parent table, client) pair.
    /// Queue workers wait for this permit before running a child unit.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub single_nested_table_max_concurrency: Option<u64>,

    /// Worker pool size for the queue strategies
    #[serde(default = "default_queue_workers")]
    #[validate(range(min = 1, max = 100_000))]
    pub queue_workers: usize,

    /// Output batching
    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchSettings,

    /// Derive resource identifiers from primary keys
    #[serde(default)]
    pub deterministic_ids: bool,

    /// Run only one shard of the root work units
    #[serde(default)]
    pub shard: Option<Shard>,

    /// Upper bound for a single table resolver invocation
    #[serde(default = "default_table_timeout_secs")]
    #[validate(range(min = 1))]
    pub table_timeout_secs: u64,

    /// Upper bound for resolving a single resource
    #[serde(default = "default_resource_timeout_secs")]
    #[validate(range(min = 1))]
    pub resource_timeout_secs: u64,

    /// Interval of the in-progress metrics log line (0 disables it)
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
}

fn default_concurrency() -> u64 {
    50_000
}

fn default_max_depth() -> usize {
    4
}

fn default_queue_workers() -> usize {
    1000
}

fn default_table_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_resource_timeout_secs() -> u64 {
    10 * 60
}

fn default_metrics_log_interval_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            concurrency: default_concurrency(),
            max_depth: default_max_depth(),
            single_resource_max_concurrency: None,
            single_nested_table_max_concurrency: None,
            queue_workers: default_queue_workers(),
            batch: BatchSettings::default(),
            deterministic_ids: false,
            shard: None,
            table_timeout_secs: default_table_timeout_secs(),
            resource_timeout_secs: default_resource_timeout_secs(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Parse from YAML, expanding `${VAR}` and `${VAR:-default}` first
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| SyncError::config(format!("invalid scheduler config: {e}")))?;
        config.validate_config()?;
        Ok(config)
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate ranges and the shard
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| SyncError::config(e.to_string()))?;
        if let Some(shard) = &self.shard {
            shard.validate_shard()?;
        }
        Ok(())
    }

    /// Builder: set the strategy
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Builder: set the global concurrency budget
    pub fn with_concurrency(mut self, concurrency: u64) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Builder: set the maximum depth
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Builder: set batch settings
    pub fn with_batch(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    /// Builder: select a shard
    pub fn with_shard(mut self, shard: Shard) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Builder: enable deterministic identifiers
    pub fn with_deterministic_ids(mut self, deterministic: bool) -> Self {
        self.deterministic_ids = deterministic;
        self
    }

    /// Builder: cap concurrent resources per (table, client) pair
    pub fn with_single_resource_max_concurrency(mut self, permits: u64) -> Self {
        self.single_resource_max_concurrency = Some(permits);
        self
    }

    /// Builder: cap concurrent child-table invocations per (parent table, client) pair
    pub fn with_single_nested_table_max_concurrency(mut self, permits: u64) -> Self {
        self.single_nested_table_max_concurrency = Some(permits);
        self
    }

    /// Builder: set the queue worker pool size
    pub fn with_queue_workers(mut self, workers: usize) -> Self {
        self.queue_workers = workers;
        self
    }

    /// Concurrent table invocations across the whole sync
    pub fn table_concurrency(&self) -> usize {
        (self.concurrency / 100).max(1) as usize
    }

    /// Concurrent resource resolutions across the whole sync
    pub fn resource_concurrency(&self) -> usize {
        self.table_concurrency() * 100
    }

    /// Permits for the table semaphore at `depth` (root is 0)
    pub fn depth_concurrency(&self, depth: usize) -> usize {
        let shift = depth.min(usize::BITS as usize - 1);
        (self.table_concurrency() >> shift).max(1)
    }

    /// Permits for each per-pair resource semaphore
    pub fn per_pair_resource_concurrency(&self) -> usize {
        self.single_resource_max_concurrency
            .map(|n| n as usize)
            .unwrap_or_else(|| self.resource_concurrency())
    }

    /// Permits for each per-pair nested-table semaphore
    pub fn per_pair_nested_concurrency(&self) -> usize {
        self.single_nested_table_max_concurrency
            .map(|n| n as usize)
            .unwrap_or_else(|| self.table_concurrency())
    }

    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    pub fn metrics_log_interval(&self) -> Option<Duration> {
        (self.metrics_log_interval_secs > 0)
            .then(|| Duration::from_secs(self.metrics_log_interval_secs))
    }
}

/// Output batching thresholds
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct BatchSettings {
    /// Rows per batch before a flush
    #[serde(default = "default_max_rows")]
    #[validate(range(min = 1))]
    pub max_rows: usize,

    /// Estimated bytes per batch before a flush
    #[serde(default = "default_max_bytes")]
    #[validate(range(min = 1))]
    pub max_bytes: usize,

    /// Staleness bound of a partially filled batch
    #[serde(default = "default_batch_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

fn default_max_rows() -> usize {
    100
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_batch_timeout_ms() -> u64 {
    100
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            timeout_ms: default_batch_timeout_ms(),
        }
    }
}

impl BatchSettings {
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One-based shard selector (`num` of `total`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Shard {
    pub num: usize,
    pub total: usize,
}

impl Shard {
    pub fn new(num: usize, total: usize) -> Result<Self> {
        let shard = Self { num, total };
        shard.validate_shard()?;
        Ok(shard)
    }

    fn validate_shard(&self) -> Result<()> {
        if self.total == 0 {
            return Err(SyncError::config("shard total must be at least 1"));
        }
        if self.num == 0 || self.num > self.total {
            return Err(SyncError::config(format!(
                "shard number must be between 1 and {}, got {}",
                self.total, self.num
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.total)
    }
}

impl FromStr for Shard {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (num, total) = s
            .split_once('/')
            .ok_or_else(|| SyncError::config(format!("invalid shard '{s}', expected num/total")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|e| SyncError::config(format!("invalid shard '{s}': {e}")))
        };
        Self::new(parse(num)?, parse(total)?)
    }
}
