//! Storage engine - coordinates level-0 buffers, level-Ns and the tag index

mod store;

pub use store::{LevelStats, MetricSummary, Store, StoreStats};

use crate::tags::FixerConfig;
use crate::{HistError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the transaction directories
    pub data_dir: PathBuf,
    /// Run `compact_suffix` after every `write_level`
    pub compact_on_write_level: bool,
    /// Histogram counters are promoted to 64 bits past this count
    pub grow_threshold: u32,
    /// Tag rewriting applied to every observed metric
    pub fixer: Option<FixerConfig>,
    /// Remove non-current directories at open
    pub collect_stale_dirs: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            compact_on_write_level: false,
            grow_threshold: crate::config::HIST_GROW_THRESHOLD,
            fixer: None,
            collect_stale_dirs: true,
        }
    }
}

impl StoreConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| HistError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grow_threshold == 0 {
            return Err(HistError::Config("grow_threshold must be positive".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(HistError::Config("data_dir is empty".into()));
        }
        Ok(())
    }
}
