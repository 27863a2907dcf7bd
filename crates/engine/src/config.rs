//! Agent configuration via `snapagent.toml`
//!
//! Every key is optional; missing keys take the defaults below. The file
//! is read once at start-up, so changes need a restart.

use serde::{Deserialize, Serialize};
use snapagent_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "snapagent.toml";

/// Default size of each extent file: 2 GiB
pub const DEFAULT_SNAP_STORE_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// A disk-to-location mapping created at start-up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingConfig {
    /// Device path of the tracked disk
    pub device: PathBuf,
    /// Directory of the snap store location
    pub location: PathBuf,
}

/// Agent configuration
///
/// # Example
///
/// ```toml
/// catalog_path = "/var/lib/snapagent/catalog.db"
/// snap_store_file_size = 2147483648
/// cow_destinations = ["/var/lib/snapagent/cow"]
/// tracked_devices = ["/dev/sdb1"]
///
/// [[snap_store_mappings]]
/// device = "/dev/sdb1"
/// location = "/var/lib/snapagent/cow"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Catalog file; `None` keeps the catalog in memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,
    /// Size of each extent file and the kernel's empty limit
    #[serde(default = "default_snap_store_file_size")]
    pub snap_store_file_size: u64,
    /// Initial extent as a percentage of the tracked device size
    #[serde(default = "default_initial_allocation_percent")]
    pub initial_allocation_percent: u8,
    /// How often to look for a new snapshot image device node
    #[serde(default = "default_device_node_attempts")]
    pub device_node_attempts: u32,
    /// Delay between device node lookups
    #[serde(default = "default_device_node_interval_ms")]
    pub device_node_interval_ms: u64,
    /// Capacity of the watcher event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// How long `wait` gives the event consumer to finish
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Directories registered as snap store locations at start-up
    #[serde(default)]
    pub cow_destinations: Vec<PathBuf>,
    /// Devices added to tracking at start-up
    #[serde(default)]
    pub tracked_devices: Vec<PathBuf>,
    /// Mappings created at start-up
    #[serde(default)]
    pub snap_store_mappings: Vec<MappingConfig>,
}

fn default_snap_store_file_size() -> u64 {
    DEFAULT_SNAP_STORE_FILE_SIZE
}

fn default_initial_allocation_percent() -> u8 {
    20
}

fn default_device_node_attempts() -> u32 {
    60
}

fn default_device_node_interval_ms() -> u64 {
    1000
}

fn default_event_queue_capacity() -> usize {
    50
}

fn default_shutdown_timeout_ms() -> u64 {
    20_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            snap_store_file_size: default_snap_store_file_size(),
            initial_allocation_percent: default_initial_allocation_percent(),
            device_node_attempts: default_device_node_attempts(),
            device_node_interval_ms: default_device_node_interval_ms(),
            event_queue_capacity: default_event_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            cow_destinations: Vec::new(),
            tracked_devices: Vec::new(),
            snap_store_mappings: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject values the agent cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.snap_store_file_size == 0 {
            return Err(Error::Config(
                "snap_store_file_size must be greater than zero".to_string(),
            ));
        }
        if !(1..=100).contains(&self.initial_allocation_percent) {
            return Err(Error::Config(format!(
                "initial_allocation_percent must be within 1..=100, got {}",
                self.initial_allocation_percent
            )));
        }
        if self.device_node_attempts == 0 {
            return Err(Error::Config(
                "device_node_attempts must be at least 1".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::Config(
                "event_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay between device node lookups
    pub fn device_node_interval(&self) -> Duration {
        Duration::from_millis(self.device_node_interval_ms)
    }

    /// Consumer shutdown deadline
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Size of the first extent for a device of `device_size` bytes
    pub fn initial_allocation(&self, device_size: u64) -> u64 {
        device_size / 100 * u64::from(self.initial_allocation_percent)
    }
}
