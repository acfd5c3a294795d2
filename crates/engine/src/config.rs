//! Cache configuration via `tessera.toml`
//!
//! Every section is optional; missing fields take their defaults. Edit the
//! file and restart the node to change settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tessera_core::{CacheError, Result};
use tessera_datasource::{DataSourceOptions, NodeRole, RetryPolicy};

/// Config file name looked up in the node's working directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// How this node participates in a cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    #[default]
    Local,
    Replicated,
    Partitioned,
    ClientCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Bound on the graceful drain and on how long writers wait for it
    pub timeout_ms: u64,
    /// Pause after telling clients to block, before draining
    pub settle_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            settle_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Applied when a caller locks without a timeout; 0 = never expires
    pub default_lock_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub enabled: bool,
    pub write_behind_workers: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub queue_capacity: usize,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            write_behind_workers: 1,
            max_retries: 3,
            retry_delay_ms: 50,
            max_retry_delay_ms: 1_000,
            queue_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub death_detection_grace_ms: u64,
    pub death_notification_grace_ms: u64,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            death_detection_grace_ms: 5_000,
            death_notification_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 0 = unbounded
    pub max_entries: usize,
    pub expiry_interval_ms: u64,
    /// Bulk operations check for cancellation between chunks of this size
    pub bulk_chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_entries: 0,
            expiry_interval_ms: 1_000,
            bulk_chunk_size: 128,
        }
    }
}

/// Node configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// name = "sessions"
/// topology = "local"
///
/// [shutdown]
/// timeout_ms = 10000
///
/// [datasource]
/// max_retries = 5
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub name: String,
    pub topology: Topology,
    /// Receives replicated writes from another site over a bridge
    pub bridge_target: bool,
    pub shutdown: ShutdownConfig,
    pub locking: LockingConfig,
    pub datasource: DataSourceConfig,
    pub clients: ClientsConfig,
    pub storage: StorageConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            topology: Topology::Local,
            bridge_target: false,
            shutdown: ShutdownConfig::default(),
            locking: LockingConfig::default(),
            datasource: DataSourceConfig::default(),
            clients: ClientsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera cache node configuration

name = "default"

# "local", "replicated", "partitioned" or "client-cache"
topology = "local"

# Set when this node receives replicated writes from another site
bridge_target = false

[shutdown]
# Upper bound on the graceful drain, and on how long writers wait for it
timeout_ms = 30000
# Pause after notifying clients to block, before draining
settle_ms = 200

[locking]
# Used when a lock is requested without a timeout (0 = never expires)
default_lock_timeout_ms = 0

[datasource]
enabled = true
write_behind_workers = 1
# Retries after the first attempt for transient provider failures
max_retries = 3
retry_delay_ms = 50
max_retry_delay_ms = 1000
queue_capacity = 10000

[clients]
death_detection_grace_ms = 5000
death_notification_grace_ms = 5000

[storage]
# 0 = unbounded
max_entries = 0
expiry_interval_ms = 1000
bulk_chunk_size = 128
"#
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(content)
            .map_err(|e| CacheError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            CacheError::Config(msg) => CacheError::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                CacheError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CacheError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            CacheError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CacheError::Config(msg.to_string()));
        if self.name.trim().is_empty() {
            return fail("name must not be empty");
        }
        if self.shutdown.timeout_ms == 0 {
            return fail("shutdown.timeout_ms must be greater than zero");
        }
        if self.datasource.write_behind_workers == 0 {
            return fail("datasource.write_behind_workers must be at least 1");
        }
        if self.datasource.queue_capacity == 0 {
            return fail("datasource.queue_capacity must be at least 1");
        }
        if self.datasource.retry_delay_ms > self.datasource.max_retry_delay_ms {
            return fail("datasource.retry_delay_ms exceeds datasource.max_retry_delay_ms");
        }
        if self.storage.expiry_interval_ms == 0 {
            return fail("storage.expiry_interval_ms must be greater than zero");
        }
        if self.storage.bulk_chunk_size == 0 {
            return fail("storage.bulk_chunk_size must be at least 1");
        }
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.shutdown.settle_ms = settle.as_millis() as u64;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.storage.max_entries = max_entries;
        self
    }

    pub fn with_expiry_interval(mut self, interval: Duration) -> Self {
        self.storage.expiry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_bulk_chunk_size(mut self, size: usize) -> Self {
        self.storage.bulk_chunk_size = size;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.datasource.max_retries = max_retries;
        self.datasource.retry_delay_ms = delay.as_millis() as u64;
        self.datasource.max_retry_delay_ms = self.datasource.max_retry_delay_ms.max(self.datasource.retry_delay_ms);
        self
    }

    pub fn with_datasource_enabled(mut self, enabled: bool) -> Self {
        self.datasource.enabled = enabled;
        self
    }

    pub fn with_client_grace(mut self, grace: Duration) -> Self {
        let ms = grace.as_millis() as u64;
        self.clients.death_detection_grace_ms = ms;
        self.clients.death_notification_grace_ms = ms;
        self
    }

    pub fn with_default_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.locking.default_lock_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.timeout_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.shutdown.settle_ms)
    }

    pub fn default_lock_timeout(&self) -> Option<Duration> {
        match self.locking.default_lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.storage.expiry_interval_ms)
    }

    pub fn death_detection_grace(&self) -> Duration {
        Duration::from_millis(self.clients.death_detection_grace_ms)
    }

    pub fn death_notification_grace(&self) -> Duration {
        Duration::from_millis(self.clients.death_notification_grace_ms)
    }

    pub fn node_role(&self) -> NodeRole {
        NodeRole {
            clustered: matches!(self.topology, Topology::Replicated | Topology::Partitioned),
            bridge_target: self.bridge_target,
            client_cache: self.topology == Topology::ClientCache,
        }
    }

    pub fn datasource_options(&self) -> DataSourceOptions {
        DataSourceOptions {
            enabled: self.datasource.enabled,
            write_behind_workers: self.datasource.write_behind_workers,
            queue_capacity: self.datasource.queue_capacity,
            retry: RetryPolicy::new()
                .with_max_retries(self.datasource.max_retries)
                .with_base_delay_ms(self.datasource.retry_delay_ms)
                .with_max_delay_ms(self.datasource.max_retry_delay_ms),
        }
    }
}
