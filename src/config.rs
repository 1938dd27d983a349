//! Configuration loading and types for Switchyard.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: node identity, mastership arbitration, topology batching, the
//! seed inventory, logging, and observability.  Every field has a default,
//! so an empty file is a valid configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::errors::ControlError;
use crate::net::{ConnectPoint, DeviceId, NodeId};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Cluster node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Mastership coordinator settings.
    #[serde(default)]
    pub mastership: MastershipConfig,

    /// Topology accumulator and assembler settings.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Devices and links preloaded into the in-memory inventory.
    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Reject values that can never work.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.mastership.store_timeout_ms == 0 {
            return Err(ControlError::invalid(
                "mastership.store_timeout_ms must be positive",
            ));
        }
        self.topology.validate()
    }

    /// This node's identifier, generating a random one when unset.
    pub fn node_id(&self) -> NodeId {
        match &self.node.id {
            Some(id) if !id.is_empty() => NodeId::new(id.clone()),
            _ => NodeId::random(),
        }
    }
}

/// Cluster node identity.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeConfig {
    /// This node's unique identifier.
    pub id: Option<String>,
}

/// Mastership coordinator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MastershipConfig {
    /// Upper bound on a single store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl MastershipConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for MastershipConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// Topology batching and build settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    /// Flush once this many events are buffered.
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Flush at the latest this long after the first buffered event.
    #[serde(default = "default_max_batch_ms")]
    pub max_batch_ms: u64,

    /// Flush when no event arrived for this long.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,

    /// Maximum number of concurrent topology builds.
    #[serde(default = "default_build_workers")]
    pub build_workers: usize,
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.max_events == 0 {
            return Err(ControlError::invalid("topology.max_events must be positive"));
        }
        if self.max_batch_ms == 0 {
            return Err(ControlError::invalid(
                "topology.max_batch_ms must be positive",
            ));
        }
        if self.max_idle_ms == 0 {
            return Err(ControlError::invalid("topology.max_idle_ms must be positive"));
        }
        if self.build_workers == 0 {
            return Err(ControlError::invalid(
                "topology.build_workers must be positive",
            ));
        }
        Ok(())
    }

    pub fn max_batch(&self) -> Duration {
        Duration::from_millis(self.max_batch_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_batch_ms: default_max_batch_ms(),
            max_idle_ms: default_max_idle_ms(),
            build_workers: default_build_workers(),
        }
    }
}

/// Seed inventory.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InventoryConfig {
    /// Devices to register at startup.
    #[serde(default)]
    pub devices: Vec<DeviceId>,

    /// Links to register at startup.
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// One seeded link, endpoints written `device/port`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the scrape endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Address the Prometheus scrape endpoint binds to.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            metrics_listen: default_metrics_listen(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_max_events() -> usize {
    1000
}

fn default_max_batch_ms() -> u64 {
    50
}

fn default_max_idle_ms() -> u64 {
    10
}

fn default_build_workers() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9464))
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("{}\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.topology.max_events, 1000);
        assert_eq!(config.topology.max_batch_ms, 50);
        assert_eq!(config.topology.max_idle_ms, 10);
        assert_eq!(config.topology.build_workers, 8);
        assert_eq!(config.mastership.store_timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.format, "text");
        assert!(config.observability.metrics);
        assert!(config.inventory.devices.is_empty());
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
node:
  id: node-7
mastership:
  store_timeout_ms: 250
topology:
  max_events: 100
  max_batch_ms: 200
  max_idle_ms: 20
  build_workers: 2
inventory:
  devices: ["of:0001", "of:0002"]
  links:
    - src: "of:0001/1"
      dst: "of:0002/2"
logging:
  level: debug
  format: json
observability:
  metrics: false
  metrics_listen: "127.0.0.1:9999"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.node_id(), NodeId::new("node-7"));
        assert_eq!(config.mastership.store_timeout_ms, 250);
        assert_eq!(config.topology.max_events, 100);
        assert_eq!(config.topology.max_batch(), Duration::from_millis(200));
        assert_eq!(config.topology.max_idle(), Duration::from_millis(20));
        assert_eq!(config.inventory.devices[1], DeviceId::new("of:0002"));
        assert_eq!(config.inventory.links[0].dst.port, 2);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.observability.metrics);
        assert_eq!(
            config.observability.metrics_listen,
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_missing_node_id_is_generated() {
        let config = Config::default();
        assert_ne!(config.node_id(), config.node_id());
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let file = write_config("topology:\n  max_events: 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("max_events"));

        let file = write_config("topology:\n  build_workers: 0\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config("mastership:\n  store_timeout_ms: 0\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_bad_connect_point_rejected() {
        let file = write_config("inventory:\n  links:\n    - src: nope\n      dst: \"a/1\"\n");
        assert!(load_config(file.path()).is_err());
    }
}
