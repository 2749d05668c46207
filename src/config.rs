//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Item eviction policy for the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict only values; keys and metadata stay resident
    #[default]
    Value,
    /// Evict whole items
    Full,
}

/// Resolved bucket-level configuration.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Number of vBuckets the key space is partitioned into
    pub max_vbuckets: u16,
    /// Number of KVStore shards (one warmup task per shard per phase)
    pub num_shards: usize,
    /// Bucket quota in bytes
    pub max_size: usize,
    /// Low watermark as a fraction of quota
    pub mem_low_wat_ratio: f64,
    /// High watermark as a fraction of quota
    pub mem_high_wat_ratio: f64,
    /// Eviction policy
    pub eviction_policy: EvictionPolicy,
    /// Maximum entries retained in a vBucket failover table
    pub max_failover_entries: usize,
    /// Data directory
    pub dbname: PathBuf,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            num_shards: 4,
            max_size: 256 * 1024 * 1024,
            mem_low_wat_ratio: 0.75,
            mem_high_wat_ratio: 0.85,
            eviction_policy: EvictionPolicy::Value,
            max_failover_entries: 25,
            dbname: PathBuf::from("data"),
        }
    }
}

impl BucketConfig {
    /// Low watermark in bytes.
    pub fn mem_low_wat(&self) -> usize {
        (self.max_size as f64 * self.mem_low_wat_ratio) as usize
    }

    /// High watermark in bytes.
    pub fn mem_high_wat(&self) -> usize {
        (self.max_size as f64 * self.mem_high_wat_ratio) as usize
    }
}

/// Resolved checkpoint configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Maximum non-meta items before the open checkpoint is rolled
    pub max_items_per_checkpoint: usize,
    /// Soft cap on checkpoints held per vBucket
    pub max_checkpoints: usize,
    /// Fraction of the bucket quota usable by checkpoints
    pub checkpoint_quota_ratio: f64,
    /// Memory recovery stops once usage falls below this fraction of the
    /// checkpoint quota
    pub recovery_lower_mark: f64,
    /// Memory recovery starts once usage exceeds this fraction of the
    /// checkpoint quota
    pub recovery_upper_mark: f64,
    /// Splice closed checkpoints to the destroyer the moment they become
    /// unreferenced
    pub eager_disposal: bool,
    /// Memory recovery task interval in milliseconds
    pub recovery_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_items_per_checkpoint: 10_000,
            max_checkpoints: 10,
            checkpoint_quota_ratio: 0.3,
            recovery_lower_mark: 0.6,
            recovery_upper_mark: 0.9,
            eager_disposal: false,
            recovery_interval_ms: 1000,
        }
    }
}

/// Resolved warmup configuration.
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Traffic is enabled once warmed-up values reach this fraction of the
    /// estimated item count
    pub num_read_cap: f64,
    /// Traffic is enabled once memory usage reaches this fraction of quota
    pub mem_used_cap: f64,
    /// Deadline for one backfill slice in milliseconds
    pub backfill_deadline_ms: u64,
    /// Base path of the per-shard access log files
    pub access_log_path: PathBuf,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            num_read_cap: 1.0,
            mem_used_cap: 0.9,
            backfill_deadline_ms: 10,
            access_log_path: PathBuf::from("access.log"),
        }
    }
}

/// Complete resolved engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Bucket-level settings
    pub bucket: BucketConfig,
    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,
    /// Warmup settings
    pub warmup: WarmupConfig,
}

impl EngineConfig {
    /// Checkpoint quota in bytes.
    pub fn checkpoint_quota(&self) -> usize {
        (self.bucket.max_size as f64 * self.checkpoint.checkpoint_quota_ratio) as usize
    }
}

/// Top-level configuration schema as read from TOML / the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxibucketConfig {
    /// Bucket overrides.
    pub bucket: Option<BucketConfigSpec>,
    /// Checkpoint overrides.
    pub checkpoint: Option<CheckpointConfigSpec>,
    /// Warmup overrides.
    pub warmup: Option<WarmupConfigSpec>,
}

impl OxibucketConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIBUCKET_CONFIG` env var (if set),
    /// then apply `OXIBUCKET__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIBUCKET_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIBUCKET__") {
                continue;
            }
            let path = key["OXIBUCKET__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["bucket", "max_vbuckets"] => {
                    self.bucket_mut().max_vbuckets = Some(parse_value(&key, &value)?);
                }
                ["bucket", "num_shards"] => {
                    self.bucket_mut().num_shards = Some(parse_value(&key, &value)?);
                }
                ["bucket", "max_size"] => {
                    self.bucket_mut().max_size = Some(parse_value(&key, &value)?);
                }
                ["bucket", "eviction_policy"] => {
                    self.bucket_mut().eviction_policy = Some(match value.as_str() {
                        "value" => EvictionPolicy::Value,
                        "full" => EvictionPolicy::Full,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                key,
                                value,
                            })
                        }
                    });
                }
                ["bucket", "max_failover_entries"] => {
                    self.bucket_mut().max_failover_entries = Some(parse_value(&key, &value)?);
                }
                ["bucket", "dbname"] => {
                    self.bucket_mut().dbname = Some(PathBuf::from(value));
                }
                ["checkpoint", "max_items_per_checkpoint"] => {
                    self.checkpoint_mut().max_items_per_checkpoint =
                        Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "max_checkpoints"] => {
                    self.checkpoint_mut().max_checkpoints = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "checkpoint_quota_ratio"] => {
                    self.checkpoint_mut().checkpoint_quota_ratio =
                        Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "eager_disposal"] => {
                    self.checkpoint_mut().eager_disposal = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "recovery_interval_ms"] => {
                    self.checkpoint_mut().recovery_interval_ms = Some(parse_value(&key, &value)?);
                }
                ["warmup", "num_read_cap"] => {
                    self.warmup_mut().num_read_cap = Some(parse_value(&key, &value)?);
                }
                ["warmup", "mem_used_cap"] => {
                    self.warmup_mut().mem_used_cap = Some(parse_value(&key, &value)?);
                }
                ["warmup", "backfill_deadline_ms"] => {
                    self.warmup_mut().backfill_deadline_ms = Some(parse_value(&key, &value)?);
                }
                ["warmup", "access_log_path"] => {
                    self.warmup_mut().access_log_path = Some(PathBuf::from(value));
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build an `EngineConfig` using defaults plus overrides.
    pub fn to_engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(bucket) = &self.bucket {
            bucket.apply_to(&mut config.bucket);
        }
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.apply_to(&mut config.checkpoint);
        }
        if let Some(warmup) = &self.warmup {
            warmup.apply_to(&mut config.warmup);
        }
        config
    }

    fn bucket_mut(&mut self) -> &mut BucketConfigSpec {
        self.bucket.get_or_insert_with(BucketConfigSpec::default)
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointConfigSpec {
        self.checkpoint
            .get_or_insert_with(CheckpointConfigSpec::default)
    }

    fn warmup_mut(&mut self) -> &mut WarmupConfigSpec {
        self.warmup.get_or_insert_with(WarmupConfigSpec::default)
    }
}

/// Bucket configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketConfigSpec {
    /// Number of vBuckets.
    pub max_vbuckets: Option<u16>,
    /// Number of shards.
    pub num_shards: Option<usize>,
    /// Quota in bytes.
    pub max_size: Option<usize>,
    /// Low watermark ratio.
    pub mem_low_wat_ratio: Option<f64>,
    /// High watermark ratio.
    pub mem_high_wat_ratio: Option<f64>,
    /// Eviction policy.
    pub eviction_policy: Option<EvictionPolicy>,
    /// Failover table size.
    pub max_failover_entries: Option<usize>,
    /// Data directory.
    pub dbname: Option<PathBuf>,
}

impl BucketConfigSpec {
    fn apply_to(&self, config: &mut BucketConfig) {
        if let Some(value) = self.max_vbuckets {
            config.max_vbuckets = value.max(1);
        }
        if let Some(value) = self.num_shards {
            config.num_shards = value.max(1);
        }
        if let Some(value) = self.max_size {
            config.max_size = value;
        }
        if let Some(value) = self.mem_low_wat_ratio {
            config.mem_low_wat_ratio = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.mem_high_wat_ratio {
            config.mem_high_wat_ratio = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.eviction_policy {
            config.eviction_policy = value;
        }
        if let Some(value) = self.max_failover_entries {
            config.max_failover_entries = value.max(1);
        }
        if let Some(value) = &self.dbname {
            config.dbname = value.clone();
        }
    }
}

/// Checkpoint configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointConfigSpec {
    /// Items per checkpoint.
    pub max_items_per_checkpoint: Option<usize>,
    /// Checkpoints per vBucket.
    pub max_checkpoints: Option<usize>,
    /// Quota ratio.
    pub checkpoint_quota_ratio: Option<f64>,
    /// Recovery lower mark.
    pub recovery_lower_mark: Option<f64>,
    /// Recovery upper mark.
    pub recovery_upper_mark: Option<f64>,
    /// Eager disposal.
    pub eager_disposal: Option<bool>,
    /// Recovery interval.
    pub recovery_interval_ms: Option<u64>,
}

impl CheckpointConfigSpec {
    fn apply_to(&self, config: &mut CheckpointConfig) {
        if let Some(value) = self.max_items_per_checkpoint {
            config.max_items_per_checkpoint = value.max(1);
        }
        if let Some(value) = self.max_checkpoints {
            config.max_checkpoints = value.max(2);
        }
        if let Some(value) = self.checkpoint_quota_ratio {
            config.checkpoint_quota_ratio = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.recovery_lower_mark {
            config.recovery_lower_mark = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.recovery_upper_mark {
            config.recovery_upper_mark = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.eager_disposal {
            config.eager_disposal = value;
        }
        if let Some(value) = self.recovery_interval_ms {
            config.recovery_interval_ms = value;
        }
    }
}

/// Warmup configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarmupConfigSpec {
    /// Read cap.
    pub num_read_cap: Option<f64>,
    /// Memory cap.
    pub mem_used_cap: Option<f64>,
    /// Backfill deadline.
    pub backfill_deadline_ms: Option<u64>,
    /// Access log path.
    pub access_log_path: Option<PathBuf>,
}

impl WarmupConfigSpec {
    fn apply_to(&self, config: &mut WarmupConfig) {
        if let Some(value) = self.num_read_cap {
            config.num_read_cap = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.mem_used_cap {
            config.mem_used_cap = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.backfill_deadline_ms {
            config.backfill_deadline_ms = value.max(1);
        }
        if let Some(value) = &self.access_log_path {
            config.access_log_path = value.clone();
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
