//! Configuration types for rawlog
//!
//! [`EngineConfig`] controls geometry decisions taken at format time and
//! how the device is opened. All fields have defaults so a partial TOML
//! file deserializes cleanly.

use crate::error::{Error, Result};
use crate::types::LogType;
use serde::{Deserialize, Serialize};

/// Default device block size (4 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default growth unit for version-log extents (1 MiB)
pub const DEFAULT_GROWTH_UNIT: u64 = 1024 * 1024;

/// Default secondary log size used to size the index (8 MiB)
pub const DEFAULT_SECONDARY_LOG_SIZE: u64 = 8 * 1024 * 1024;

/// Default number of index entries reserved per secondary log
pub const DEFAULT_INDEX_FACTOR: u64 = 4;

/// Smallest block size accepted (one sector)
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Block size used for alignment and index grouping
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Extent size for new version-log links and default open size
    #[serde(default = "default_growth_unit")]
    pub growth_unit: u64,
    /// Expected size of a secondary log, used to size the index
    #[serde(default = "default_secondary_log_size")]
    pub secondary_log_size: u64,
    /// Index entries reserved per secondary log (head plus version links)
    #[serde(default = "default_index_factor")]
    pub index_factor: u64,
    /// Open the device with O_DIRECT (the device is always O_SYNC)
    #[serde(default = "default_direct_io")]
    pub direct_io: bool,
    /// Name markers used to classify logs
    #[serde(default)]
    pub markers: NameMarkers,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            growth_unit: DEFAULT_GROWTH_UNIT,
            secondary_log_size: DEFAULT_SECONDARY_LOG_SIZE,
            index_factor: DEFAULT_INDEX_FACTOR,
            direct_io: true,
            markers: NameMarkers::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for page-cached scratch files (tests, tmpfs)
    #[must_use]
    pub fn buffered() -> Self {
        Self {
            direct_io: false,
            ..Default::default()
        }
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "block size {} must be a power of two >= {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.growth_unit == 0 || self.growth_unit % u64::from(self.block_size) != 0 {
            return Err(Error::Configuration(format!(
                "growth unit {} must be a non-zero multiple of the block size {}",
                self.growth_unit, self.block_size
            )));
        }
        if self.secondary_log_size == 0 {
            return Err(Error::Configuration(
                "secondary log size must be non-zero".into(),
            ));
        }
        if self.index_factor == 0 {
            return Err(Error::Configuration("index factor must be non-zero".into()));
        }
        self.markers.validate()
    }
}

/// Substrings that classify a log name into a [`LogType`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NameMarkers {
    #[serde(default = "default_primary_marker")]
    pub primary: String,
    #[serde(default = "default_secondary_marker")]
    pub secondary: String,
    #[serde(default = "default_version_marker")]
    pub version: String,
}

impl Default for NameMarkers {
    fn default() -> Self {
        Self {
            primary: default_primary_marker(),
            secondary: default_secondary_marker(),
            version: default_version_marker(),
        }
    }
}

impl NameMarkers {
    /// Classify a log name; primary wins over secondary over version
    pub fn classify(&self, name: &str) -> Result<LogType> {
        if name.contains(self.primary.as_str()) {
            Ok(LogType::Primary)
        } else if name.contains(self.secondary.as_str()) {
            Ok(LogType::Secondary)
        } else if name.contains(self.version.as_str()) {
            Ok(LogType::Version)
        } else {
            Err(Error::InvalidName(name.to_string()))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.primary.is_empty() || self.secondary.is_empty() || self.version.is_empty() {
            return Err(Error::Configuration("name markers must be non-empty".into()));
        }
        Ok(())
    }
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_growth_unit() -> u64 {
    DEFAULT_GROWTH_UNIT
}

fn default_secondary_log_size() -> u64 {
    DEFAULT_SECONDARY_LOG_SIZE
}

fn default_index_factor() -> u64 {
    DEFAULT_INDEX_FACTOR
}

fn default_direct_io() -> bool {
    true
}

fn default_primary_marker() -> String {
    "prim".to_string()
}

fn default_secondary_marker() -> String {
    "sec".to_string()
}

fn default_version_marker() -> String {
    "ver".to_string()
}
