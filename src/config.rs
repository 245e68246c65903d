//! Partitioning configuration.

use crate::error::{QtSortError, Result};
use crate::quadtree::MAX_DEPTH;
use serde::{Deserialize, Serialize};

/// Settings for counting, group finding and routing.
///
/// Every field has a default, so a configuration file only needs the keys it
/// changes. Unknown keys are rejected.
///
/// # Example
///
/// ```rust
/// use qtsort::Config;
///
/// let config = Config::from_json(r#"{ "target": 40000, "minsize": 20000 }"#)?;
/// assert_eq!(config.target, 40000);
/// assert_eq!(config.maxlevel, 17);
/// # Ok::<(), qtsort::QtSortError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Desired weight per group
    #[serde(default = "Config::default_target")]
    pub target: i64,

    /// Smallest weight worth a group of its own
    #[serde(default = "Config::default_minsize")]
    pub minsize: i64,

    /// Accumulated routing weight which triggers a flush to the writer
    #[serde(default = "Config::default_writeat")]
    pub writeat: i64,

    /// Number of worker threads
    #[serde(default = "Config::default_numchan")]
    pub numchan: usize,

    /// Counts are added to the tree at no deeper than this level
    #[serde(default = "Config::default_maxlevel")]
    pub maxlevel: u32,

    /// Fold small subtrees into their parents before finding groups
    #[serde(default)]
    pub rollup: bool,

    /// Use fixed tiles at this level instead of finding groups
    #[serde(default)]
    pub round_level: Option<u32>,

    /// Number of groups sharing one routed tile
    #[serde(default = "Config::default_blocksplit")]
    pub blocksplit: usize,

    /// Capacity of each stage's queue
    #[serde(default = "Config::default_queue_capacity")]
    pub queue_capacity: usize,

    /// Distinct tiles a counting thread holds before flushing
    #[serde(default = "Config::default_count_limit")]
    pub count_limit: usize,
}

impl Config {
    const fn default_target() -> i64 {
        8000
    }

    const fn default_minsize() -> i64 {
        4000
    }

    const fn default_writeat() -> i64 {
        1_000_000
    }

    fn default_numchan() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    const fn default_maxlevel() -> u32 {
        17
    }

    const fn default_blocksplit() -> usize {
        1
    }

    const fn default_queue_capacity() -> usize {
        4
    }

    const fn default_count_limit() -> usize {
        1_000_000
    }

    pub fn with_target(mut self, target: i64, minsize: i64) -> Self {
        self.target = target;
        self.minsize = minsize;
        self
    }

    pub fn with_writeat(mut self, writeat: i64) -> Self {
        self.writeat = writeat;
        self
    }

    pub fn with_numchan(mut self, numchan: usize) -> Self {
        self.numchan = numchan;
        self
    }

    pub fn with_maxlevel(mut self, maxlevel: u32) -> Self {
        self.maxlevel = maxlevel;
        self
    }

    pub fn with_rollup(mut self, rollup: bool) -> Self {
        self.rollup = rollup;
        self
    }

    pub fn with_round_level(mut self, level: Option<u32>) -> Self {
        self.round_level = level;
        self
    }

    pub fn with_blocksplit(mut self, blocksplit: usize) -> Self {
        self.blocksplit = blocksplit;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_count_limit(mut self, limit: usize) -> Self {
        self.count_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target <= 0 {
            return Err(invalid("target must be positive"));
        }
        if self.minsize < 0 || self.minsize > self.target {
            return Err(invalid("minsize must be between 0 and target"));
        }
        if self.writeat <= 0 {
            return Err(invalid("writeat must be positive"));
        }
        if self.numchan == 0 {
            return Err(invalid("numchan must be at least 1"));
        }
        if self.maxlevel > MAX_DEPTH {
            return Err(invalid(&format!("maxlevel must not exceed {}", MAX_DEPTH)));
        }
        if let Some(level) = self.round_level
            && level > self.maxlevel
        {
            return Err(invalid("round_level must not exceed maxlevel"));
        }
        if self.blocksplit == 0 {
            return Err(invalid("blocksplit must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load configuration from TOML (requires the `toml` feature)
    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(toml_str).map_err(|e| QtSortError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| QtSortError::Serialization(e.to_string()))
    }
}

fn invalid(msg: &str) -> QtSortError {
    QtSortError::InvalidConfig(msg.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: Self::default_target(),
            minsize: Self::default_minsize(),
            writeat: Self::default_writeat(),
            numchan: Self::default_numchan(),
            maxlevel: Self::default_maxlevel(),
            rollup: false,
            round_level: None,
            blocksplit: Self::default_blocksplit(),
            queue_capacity: Self::default_queue_capacity(),
            count_limit: Self::default_count_limit(),
        }
    }
}
