//! LedgerScale Configuration
//!
//! This module provides configuration structures for the ledger client:
//! quorum defaults, rack mapping, metadata paths and the statically
//! declared cluster used by the CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::net::DEFAULT_RACK;

/// Main LedgerScale configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerScaleConfig {
    /// Client behaviour
    #[serde(default)]
    pub client: ClientConfig,

    /// Default quorum shape for new ledgers
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Rack-aware placement configuration
    #[serde(default)]
    pub placement: PlacementConfig,

    /// Ledger metadata store layout
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Statically declared bookies
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address of this process, used to anchor the first ensemble position
    #[serde(default)]
    pub local_address: Option<SocketAddr>,

    /// Only change the ensemble once the ack quorum can no longer be reached
    #[serde(default = "default_true")]
    pub delay_ensemble_change: bool,

    /// Attempts at writing repaired metadata before giving up
    #[serde(default = "default_max_metadata_retries")]
    pub max_metadata_retries: u32,

    /// Secret mixed into entry integrity tags
    #[serde(default)]
    pub digest_password: String,
}

/// Default quorum shape for new ledgers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ensemble_size")]
    pub ensemble_size: usize,

    #[serde(default = "default_write_quorum_size")]
    pub write_quorum_size: usize,

    #[serde(default = "default_ack_quorum_size")]
    pub ack_quorum_size: usize,
}

/// Rack-aware placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Rack assigned to hosts the mapping does not know
    #[serde(default = "default_rack")]
    pub default_rack: String,

    /// Host (ip or hostname) to rack path
    #[serde(default)]
    pub racks: BTreeMap<String, String>,

    /// Memoise resolved locations
    #[serde(default = "default_true")]
    pub cache_resolved: bool,
}

/// Ledger metadata store layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Root path under which ledgers are registered
    #[serde(default = "default_ledgers_root_path")]
    pub ledgers_root_path: String,
}

/// Statically declared cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Writable bookies
    #[serde(default)]
    pub bookies: Vec<SocketAddr>,

    /// Read-only bookies
    #[serde(default)]
    pub read_only: Vec<SocketAddr>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_metadata_retries() -> u32 {
    3
}

fn default_ensemble_size() -> usize {
    3
}

fn default_write_quorum_size() -> usize {
    2
}

fn default_ack_quorum_size() -> usize {
    2
}

fn default_rack() -> String {
    DEFAULT_RACK.to_string()
}

fn default_ledgers_root_path() -> String {
    "/ledgers".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_address: None,
            delay_ensemble_change: true,
            max_metadata_retries: default_max_metadata_retries(),
            digest_password: String::new(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ensemble_size: default_ensemble_size(),
            write_quorum_size: default_write_quorum_size(),
            ack_quorum_size: default_ack_quorum_size(),
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            default_rack: default_rack(),
            racks: BTreeMap::new(),
            cache_resolved: true,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ledgers_root_path: default_ledgers_root_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl LedgerConfig {
    /// Check that `ack <= write <= ensemble` and none of them is zero
    pub fn validate(&self) -> crate::Result<()> {
        validate_quorum(self.ensemble_size, self.write_quorum_size, self.ack_quorum_size)
    }
}

/// Check a quorum shape
pub fn validate_quorum(ensemble: usize, write_quorum: usize, ack_quorum: usize) -> crate::Result<()> {
    if ack_quorum == 0 {
        return Err(crate::Error::Config("ack_quorum_size must be at least 1".into()));
    }
    if write_quorum < ack_quorum {
        return Err(crate::Error::Config(format!(
            "write_quorum_size ({}) must be >= ack_quorum_size ({})",
            write_quorum, ack_quorum
        )));
    }
    if ensemble < write_quorum {
        return Err(crate::Error::Config(format!(
            "ensemble_size ({}) must be >= write_quorum_size ({})",
            ensemble, write_quorum
        )));
    }
    Ok(())
}

impl LedgerScaleConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LedgerScaleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.ledger.validate()?;

        if self.placement.default_rack.is_empty() {
            return Err(crate::Error::Config("placement.default_rack cannot be empty".into()));
        }

        if !self.metadata.ledgers_root_path.starts_with('/') {
            return Err(crate::Error::Config(
                "metadata.ledgers_root_path must be absolute".into(),
            ));
        }

        for addr in &self.cluster.read_only {
            if self.cluster.bookies.contains(addr) {
                return Err(crate::Error::Config(format!(
                    "bookie {} is listed as both writable and read-only",
                    addr
                )));
            }
        }

        Ok(())
    }

    /// Path under which available bookies register
    pub fn available_bookies_path(&self) -> String {
        format!("{}/available", self.metadata.ledgers_root_path.trim_end_matches('/'))
    }

    /// Render a sample configuration
    pub fn sample() -> crate::Result<String> {
        let mut config = LedgerScaleConfig::default();
        config.cluster.bookies = vec![
            SocketAddr::from(([10, 0, 1, 1], 3181)),
            SocketAddr::from(([10, 0, 1, 2], 3181)),
            SocketAddr::from(([10, 0, 2, 1], 3181)),
            SocketAddr::from(([10, 0, 2, 2], 3181)),
        ];
        config.placement.racks.insert("10.0.1.1".into(), "/rack-1".into());
        config.placement.racks.insert("10.0.1.2".into(), "/rack-1".into());
        config.placement.racks.insert("10.0.2.1".into(), "/rack-2".into());
        config.placement.racks.insert("10.0.2.2".into(), "/rack-2".into());

        toml::to_string_pretty(&config)
            .map_err(|e| crate::Error::Internal(format!("failed to render sample config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[client]
local_address = "10.0.1.9:0"
delay_ensemble_change = false

[ledger]
ensemble_size = 5
write_quorum_size = 3
ack_quorum_size = 2

[placement]
racks = { "10.0.1.1" = "/rack-1", "10.0.2.1" = "/rack-2" }

[cluster]
bookies = ["10.0.1.1:3181", "10.0.2.1:3181"]
read_only = ["10.0.3.1:3181"]
"#;

        let config = LedgerScaleConfig::from_str(toml).unwrap();
        assert!(!config.client.delay_ensemble_change);
        assert_eq!(config.client.max_metadata_retries, 3);
        assert_eq!(config.ledger.ensemble_size, 5);
        assert_eq!(config.placement.racks.len(), 2);
        assert_eq!(config.placement.default_rack, "/default-rack");
        assert_eq!(config.cluster.bookies.len(), 2);
        assert_eq!(config.available_bookies_path(), "/ledgers/available");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = LedgerScaleConfig::from_str("").unwrap();
        assert!(config.client.delay_ensemble_change);
        assert_eq!(config.ledger.write_quorum_size, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_quorum_rejected() {
        let toml = r#"
[ledger]
ensemble_size = 3
write_quorum_size = 2
ack_quorum_size = 3
"#;
        assert!(matches!(
            LedgerScaleConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));

        assert!(validate_quorum(2, 3, 1).is_err());
        assert!(validate_quorum(3, 3, 0).is_err());
        assert!(validate_quorum(3, 3, 3).is_ok());
    }

    #[test]
    fn test_overlapping_cluster_rejected() {
        let toml = r#"
[cluster]
bookies = ["10.0.1.1:3181"]
read_only = ["10.0.1.1:3181"]
"#;
        assert!(LedgerScaleConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_sample_round_trips_through_file() {
        let sample = LedgerScaleConfig::sample().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample.as_bytes()).unwrap();

        let config = LedgerScaleConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster.bookies.len(), 4);
        assert_eq!(config.placement.racks.get("10.0.2.1").map(String::as_str), Some("/rack-2"));
    }
}
