//! Targeted sweep configuration via `targeted-sweep.toml`
//!
//! Every field is optional; a missing field takes its default. The enable
//! flag and the shard count read here only seed the runtime suppliers of the
//! sweeper, which may change them without a restart.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tsweep_core::{Error, Result, SweepStrategy};
use tsweep_queue::MAX_SHARDS;

/// Config file name conventionally used for targeted sweep settings.
pub const CONFIG_FILE_NAME: &str = "targeted-sweep.toml";

/// Targeted sweep configuration.
///
/// # Example
///
/// ```toml
/// enabled = true
/// shards = 8
/// conservative_threads = 2
/// thorough_threads = 1
/// pause_millis = 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetedSweepConfig {
    /// Initial value of the runtime enable flag.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Number of shards writes are spread over (1..=256).
    #[serde(default = "default_shards")]
    pub shards: u32,
    /// Background workers sweeping conservative queues.
    #[serde(default = "default_threads")]
    pub conservative_threads: usize,
    /// Background workers sweeping thorough queues.
    #[serde(default = "default_threads")]
    pub thorough_threads: usize,
    /// Pause between two iterations of a background worker.
    #[serde(default = "default_pause_millis")]
    pub pause_millis: u64,
    /// Upper bound of the random delay before a worker's first iteration.
    #[serde(default)]
    pub initial_delay_millis: u64,
    /// Idle outcomes in a row after which a worker gives up its lease.
    #[serde(default = "default_max_consecutive_empty_batches")]
    pub max_consecutive_empty_batches: u32,
    /// Longest time a worker keeps sweeping under one lease.
    #[serde(default = "default_lease_budget_millis")]
    pub lease_budget_millis: u64,
    /// How long a lock request may wait for a held lease.
    #[serde(default = "default_lock_acquire_timeout_millis")]
    pub lock_acquire_timeout_millis: u64,
    /// Fine partitions a single batch may accumulate.
    #[serde(default = "default_max_partitions_per_batch")]
    pub max_partitions_per_batch: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_shards() -> u32 {
    1
}

fn default_threads() -> usize {
    1
}

fn default_pause_millis() -> u64 {
    500
}

fn default_max_consecutive_empty_batches() -> u32 {
    3
}

fn default_lease_budget_millis() -> u64 {
    5_000
}

fn default_lock_acquire_timeout_millis() -> u64 {
    100
}

fn default_max_partitions_per_batch() -> usize {
    1
}

impl Default for TargetedSweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            shards: default_shards(),
            conservative_threads: default_threads(),
            thorough_threads: default_threads(),
            pause_millis: default_pause_millis(),
            initial_delay_millis: 0,
            max_consecutive_empty_batches: default_max_consecutive_empty_batches(),
            lease_budget_millis: default_lease_budget_millis(),
            lock_acquire_timeout_millis: default_lock_acquire_timeout_millis(),
            max_partitions_per_batch: default_max_partitions_per_batch(),
        }
    }
}

impl TargetedSweepConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Targeted sweep configuration
#
# Switch sweeping on or off (default: true)
enabled = true

# Shards writes are spread over, 1 to 256 (default: 1).
# May be raised at any time, never lowered.
shards = 1

# Background workers per strategy (default: 1 each, 0 disables the strategy)
conservative_threads = 1
thorough_threads = 1

# Pause between background iterations, in milliseconds (default: 500)
pause_millis = 500

# Random delay before a worker's first iteration, up to this many ms (default: 0)
initial_delay_millis = 0

# Idle batches in a row before a worker releases its shard (default: 3)
max_consecutive_empty_batches = 3

# Longest a worker sweeps one shard before releasing it, in ms (default: 5000)
lease_budget_millis = 5000

# How long a worker waits for a shard lease, in ms (default: 100)
lock_acquire_timeout_millis = 100

# Fine partitions one batch may span (default: 1)
max_partitions_per_batch = 1
"#
    }

    /// Parse and validate config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: TargetedSweepConfig = toml::from_str(content)
            .map_err(|e| Error::InvalidConfiguration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the file cannot be read or parsed,
    /// or holds out-of-range values.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfiguration(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content).map_err(|e| match e {
            Error::InvalidConfiguration(msg) => {
                Error::InvalidConfiguration(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::InvalidConfiguration(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Reject values the sweeper cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 || self.shards > MAX_SHARDS {
            return Err(Error::InvalidConfiguration(format!(
                "shards must be between 1 and {}, got {}",
                MAX_SHARDS, self.shards
            )));
        }
        if self.max_consecutive_empty_batches == 0 {
            return Err(Error::InvalidConfiguration(
                "max_consecutive_empty_batches must be at least 1".to_string(),
            ));
        }
        if self.max_partitions_per_batch == 0 {
            return Err(Error::InvalidConfiguration(
                "max_partitions_per_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Background workers configured for `strategy`.
    pub fn threads_for(&self, strategy: SweepStrategy) -> usize {
        match strategy {
            SweepStrategy::Conservative => self.conservative_threads,
            SweepStrategy::Thorough => self.thorough_threads,
        }
    }

    pub(crate) fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_millis)
    }

    pub(crate) fn lease_budget(&self) -> Duration {
        Duration::from_millis(self.lease_budget_millis)
    }

    pub(crate) fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_millis)
    }
}
