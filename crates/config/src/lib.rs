//! Configuration schema and loader for deskvault.

use deskvault_common::validate_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Backing store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Read cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Secondary index settings.
    #[serde(default)]
    pub index: IndexConfig,

    /// Per-operation quotas.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Transaction coordinator settings.
    #[serde(default)]
    pub txn: TxnConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the WAL.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// Hard ceiling on a single stored value, in bytes.
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,

    /// Size of each chunk of an oversized record, in bytes.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            max_value_bytes: default_max_value_bytes(),
            chunk_bytes: default_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a cached record is served, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// How a field value is turned into an index bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// The field's value rendered as a string.
    #[default]
    Value,
    /// A millisecond timestamp bucketed to a UTC day.
    Day,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    /// Index name, used in lookups.
    pub name: String,
    /// Record field the index reads.
    pub field: String,
    #[serde(default)]
    pub kind: IndexKind,
}

impl IndexField {
    pub fn new(name: &str, field: &str, kind: IndexKind) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Members allowed in one index entry before eviction.
    #[serde(default = "default_index_max_entries")]
    pub max_entries: usize,

    /// Members kept after eviction.
    #[serde(default = "default_index_evict_to")]
    pub evict_to: usize,

    /// Indexed fields.
    #[serde(default = "default_index_fields")]
    pub fields: Vec<IndexField>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_entries: default_index_max_entries(),
            evict_to: default_index_evict_to(),
            fields: default_index_fields(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub per_minute: u64,
    pub per_day: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Operation name -> ceilings. Unlisted operations are unlimited.
    #[serde(default)]
    pub limits: BTreeMap<String, QuotaLimit>,

    /// Interval between expired-counter cleanup passes, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Maximum wait for the quota lock, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limits: BTreeMap::new(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Maximum wait for the transaction lock, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

// --- Defaults ---

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_max_value_bytes() -> usize {
    8 * 1024
}
fn default_chunk_bytes() -> usize {
    7 * 1024
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_index_max_entries() -> usize {
    1000
}
fn default_index_evict_to() -> usize {
    500
}
fn default_index_fields() -> Vec<IndexField> {
    vec![
        IndexField::new("status", "status", IndexKind::Value),
        IndexField::new("priority", "priority", IndexKind::Value),
        IndexField::new("owner", "assignedTo", IndexKind::Value),
        IndexField::new("date", "createdAt", IndexKind::Day),
    ]
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_lock_timeout_ms() -> u64 {
    10_000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl VaultConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage.chunk_bytes must be > 0".into(),
            ));
        }
        if self.storage.chunk_bytes >= self.storage.max_value_bytes {
            return Err(ConfigError::Invalid(format!(
                "storage.chunk_bytes ({}) must be < storage.max_value_bytes ({})",
                self.storage.chunk_bytes, self.storage.max_value_bytes
            )));
        }
        if self.index.evict_to == 0 || self.index.evict_to >= self.index.max_entries {
            return Err(ConfigError::Invalid(format!(
                "index.evict_to ({}) must be > 0 and < index.max_entries ({})",
                self.index.evict_to, self.index.max_entries
            )));
        }
        let mut names = HashSet::new();
        for field in &self.index.fields {
            validate_name("index name", &field.name)
                .map_err(|e| ConfigError::Invalid(format!("index.fields: {}", e)))?;
            if !names.insert(field.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "index.fields: duplicate index name {:?}",
                    field.name
                )));
            }
        }
        for (op, limit) in &self.quota.limits {
            validate_name("operation name", op)
                .map_err(|e| ConfigError::Invalid(format!("quota.limits: {}", e)))?;
            if limit.per_minute == 0 || limit.per_day == 0 {
                return Err(ConfigError::Invalid(format!(
                    "quota.limits.{}: per_minute and per_day must be > 0",
                    op
                )));
            }
        }
        if self.quota.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "quota.cleanup_interval_secs must be > 0".into(),
            ));
        }
        if self.quota.lock_timeout_ms == 0 || self.txn.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load a `VaultConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<VaultConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `VaultConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<VaultConfig, ConfigError> {
    let config: VaultConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
