//! Replicore Configuration
//!
//! Configuration structures for the data replication engine. Values load
//! from TOML with per-field defaults; durations are configured in
//! milliseconds and exposed as `Duration` accessors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::oplog::DEFAULT_BUFFER_CAPACITY_BYTES;
use crate::remote::{HostAndPort, Namespace};

/// Main replicator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicatorConfig {
    /// Sync source selection and retry configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Oplog fetch and buffer configuration
    #[serde(default)]
    pub oplog: OplogConfig,

    /// Sync source blacklist penalties
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

/// Sync source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Fallback sync source when no coordinator is configured, `host:port`
    #[serde(default)]
    pub source: Option<String>,

    /// Fallback start position when no coordinator is configured
    #[serde(default)]
    pub start_optime: u64,

    /// Delay between sync source lookups in milliseconds
    #[serde(default = "default_source_retry_wait_ms")]
    pub source_retry_wait_ms: u64,

    /// Delay between initial sync attempts in milliseconds
    #[serde(default = "default_initial_sync_retry_wait_ms")]
    pub initial_sync_retry_wait_ms: u64,
}

/// Oplog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogConfig {
    /// Remote oplog namespace, `database.collection`
    #[serde(default = "default_oplog_namespace")]
    pub namespace: String,

    /// Oplog buffer capacity in bytes
    #[serde(default = "default_buffer_capacity_bytes")]
    pub buffer_capacity_bytes: usize,
}

/// Blacklist penalty configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// Penalty after the sync source rolled its oplog past our start
    /// position, in milliseconds
    #[serde(default = "default_oplog_start_missing_penalty_ms")]
    pub oplog_start_missing_penalty_ms: u64,

    /// Penalty after a network error against the sync source, in
    /// milliseconds
    #[serde(default = "default_network_error_penalty_ms")]
    pub network_error_penalty_ms: u64,
}

fn default_source_retry_wait_ms() -> u64 {
    1000
}

fn default_initial_sync_retry_wait_ms() -> u64 {
    1000
}

fn default_oplog_namespace() -> String {
    "local.oplog.rs".to_string()
}

fn default_buffer_capacity_bytes() -> usize {
    DEFAULT_BUFFER_CAPACITY_BYTES
}

fn default_oplog_start_missing_penalty_ms() -> u64 {
    600_000
}

fn default_network_error_penalty_ms() -> u64 {
    10_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: None,
            start_optime: 0,
            source_retry_wait_ms: default_source_retry_wait_ms(),
            initial_sync_retry_wait_ms: default_initial_sync_retry_wait_ms(),
        }
    }
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            namespace: default_oplog_namespace(),
            buffer_capacity_bytes: default_buffer_capacity_bytes(),
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            oplog_start_missing_penalty_ms: default_oplog_start_missing_penalty_ms(),
            network_error_penalty_ms: default_network_error_penalty_ms(),
        }
    }
}

impl ReplicatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: ReplicatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.oplog.buffer_capacity_bytes == 0 {
            return Err(crate::Error::Config(
                "oplog.buffer_capacity_bytes must be non-zero".into(),
            ));
        }
        self.oplog.namespace.parse::<Namespace>().map_err(|_| {
            crate::Error::Config(format!("bad oplog namespace '{}'", self.oplog.namespace))
        })?;
        if let Some(source) = &self.sync.source {
            source.parse::<HostAndPort>().map_err(|_| {
                crate::Error::Config(format!("bad sync source '{}'", source))
            })?;
        }
        Ok(())
    }

    /// Get the remote oplog namespace
    pub fn oplog_namespace(&self) -> crate::Result<Namespace> {
        self.oplog.namespace.parse()
    }

    /// Get the fallback sync source, if configured
    pub fn sync_source(&self) -> crate::Result<Option<HostAndPort>> {
        self.sync.source.as_deref().map(str::parse).transpose()
    }

    /// Get the delay between sync source lookups as a Duration
    pub fn source_retry_wait(&self) -> Duration {
        Duration::from_millis(self.sync.source_retry_wait_ms)
    }

    /// Get the delay between initial sync attempts as a Duration
    pub fn initial_sync_retry_wait(&self) -> Duration {
        Duration::from_millis(self.sync.initial_sync_retry_wait_ms)
    }

    /// Get the oplog-start-missing blacklist penalty as a Duration
    pub fn oplog_start_missing_penalty(&self) -> Duration {
        Duration::from_millis(self.blacklist.oplog_start_missing_penalty_ms)
    }

    /// Get the network-error blacklist penalty as a Duration
    pub fn network_error_penalty(&self) -> Duration {
        Duration::from_millis(self.blacklist.network_error_penalty_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sync]
source = "primary.example.com:27017"
start_optime = 12
initial_sync_retry_wait_ms = 250

[oplog]
namespace = "local.oplog.rs"
buffer_capacity_bytes = 1048576
"#;

        let config = ReplicatorConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.sync_source().unwrap(),
            Some(HostAndPort::new("primary.example.com", 27017))
        );
        assert_eq!(config.sync.start_optime, 12);
        assert_eq!(config.initial_sync_retry_wait(), Duration::from_millis(250));
        assert_eq!(config.oplog.buffer_capacity_bytes, 1048576);
        // Untouched sections keep their defaults.
        assert_eq!(config.source_retry_wait(), Duration::from_millis(1000));
        assert_eq!(config.network_error_penalty(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::from_toml("").unwrap();
        assert_eq!(config.oplog_namespace().unwrap().to_string(), "local.oplog.rs");
        assert_eq!(config.oplog.buffer_capacity_bytes, DEFAULT_BUFFER_CAPACITY_BYTES);
        assert_eq!(config.sync_source().unwrap(), None);
        assert_eq!(
            config.oplog_start_missing_penalty(),
            Duration::from_millis(600_000)
        );
    }

    #[test]
    fn test_validation_rejects_bad_namespace() {
        let toml = r#"
[oplog]
namespace = "nodot"
"#;
        assert!(ReplicatorConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_source() {
        let toml = r#"
[sync]
source = "missing-port"
"#;
        assert!(ReplicatorConfig::from_toml(toml).is_err());
    }
}
